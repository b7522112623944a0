//! A dummy input feeding a stdout output, driven through the C entry points
//! the way the host drives a loaded plugin library.
//!
//! Run with `cargo run --example pipeline`.

use std::ffi::{c_char, c_void, CStr};
use std::time::Duration;

use flb_bridge::ffi::{
    self, flb_bridge_buffer_free, flb_bridge_plugin_exit, flb_bridge_plugin_flush,
    flb_bridge_plugin_init, flb_bridge_plugin_input_collect,
};
use flb_bridge::{
    register_input, register_output, BridgeConfig, ConfigLoader, Context, InputPlugin,
    OutputPlugin, PluginResult, Record, RecordReceiver, RecordSender, SendError,
};

struct Dummy;

impl InputPlugin for Dummy {
    fn init(&self, _ctx: &Context, _config: &dyn ConfigLoader) -> PluginResult {
        Ok(())
    }

    fn flush(&self, ctx: &Context, records: RecordSender) -> PluginResult {
        let mut seq = 0i64;
        while !ctx.sleep(Duration::from_millis(200)) {
            let record = Record::now("dummy")
                .with_field("message", "dummy event")
                .with_field("seq", seq);
            match records.send(ctx, record) {
                Ok(()) => seq += 1,
                Err(SendError::Cancelled(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

struct Stdout;

impl OutputPlugin for Stdout {
    fn init(&self, _ctx: &Context, config: &dyn ConfigLoader) -> PluginResult {
        tracing::info!(format = %config.get_or("format", "text"), "stdout output ready");
        Ok(())
    }

    fn collect(&self, _ctx: &Context, tag: &str, records: RecordReceiver) -> PluginResult {
        for record in records {
            println!("[{}] {} {}", tag, record.time().to_rfc3339(), record.fields_display());
        }
        Ok(())
    }
}

// Host-side config callback: every key resolves through a fixed table.
unsafe extern "C" fn host_config(_ctx: *mut c_void, key: *const c_char) -> *const c_char {
    match CStr::from_ptr(key).to_str() {
        Ok(k) if k.eq_ignore_ascii_case("format") => c"text".as_ptr(),
        _ => std::ptr::null(),
    }
}

fn main() -> flb_bridge::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    register_input("dummy", "emits a counter every 200ms", Dummy)?;
    register_output("stdout", "prints records", Stdout)?;
    ffi::install(BridgeConfig::new().with_shutdown_timeout(Duration::from_secs(1)));
    println!("{}", flb_bridge::global().listing());

    let input = c"dummy";
    let output = c"stdout";

    unsafe {
        flb_bridge_plugin_init(input.as_ptr(), None, std::ptr::null_mut());
        flb_bridge_plugin_init(output.as_ptr(), Some(host_config), std::ptr::null_mut());

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(250));

            let mut data = std::ptr::null_mut();
            let mut len = 0;
            flb_bridge_plugin_input_collect(input.as_ptr(), &mut data, &mut len);
            if !data.is_null() {
                flb_bridge_plugin_flush(output.as_ptr(), data, len, c"dummy.0".as_ptr());
                flb_bridge_buffer_free(data, len);
            }
        }

        // Route whatever the input still had queued before stopping the output.
        let mut data = std::ptr::null_mut();
        let mut len = 0;
        flb_bridge_plugin_exit(input.as_ptr(), &mut data, &mut len);
        if !data.is_null() {
            flb_bridge_plugin_flush(output.as_ptr(), data, len, c"dummy.0".as_ptr());
            flb_bridge_buffer_free(data, len);
        }
        flb_bridge_plugin_exit(output.as_ptr(), std::ptr::null_mut(), std::ptr::null_mut());
    }

    Ok(())
}
