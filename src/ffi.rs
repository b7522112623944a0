//! C ABI entry points for the host.
//!
//! Thin `extern "C"` shims over a process-wide [`Bridge`]. Each shim:
//! - null-checks and validates its pointer arguments
//! - runs under `catch_unwind` so no panic crosses the boundary
//! - returns a raw [`Status`] code
//!
//! Buffers handed to the host by [`flb_bridge_plugin_input_collect`] and
//! [`flb_bridge_plugin_exit`] are owned by the host until it passes them back
//! to [`flb_bridge_buffer_free`].

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use crate::bridge::{Bridge, Status};
use crate::config::{BridgeConfig, ConfigLoader};
use crate::error::panic_message;
use crate::plugin::PluginKind;

/// Host callback returning the value of a configuration key, or null.
///
/// The returned string must stay valid until the callback is invoked again.
pub type ConfigGetFn = unsafe extern "C" fn(ctx: *mut c_void, key: *const c_char) -> *const c_char;

/// Returned by [`flb_bridge_plugin_kind`] for an unknown plugin.
pub const KIND_UNKNOWN: c_int = -1;
/// Returned by [`flb_bridge_plugin_kind`] for an input plugin.
pub const KIND_INPUT: c_int = 0;
/// Returned by [`flb_bridge_plugin_kind`] for an output plugin.
pub const KIND_OUTPUT: c_int = 1;

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// Install the process-wide bridge with a specific configuration.
///
/// Returns `false` if a bridge is already installed. Call before the host
/// issues its first call.
pub fn install(config: BridgeConfig) -> bool {
    let mut installed = false;
    BRIDGE.get_or_init(|| {
        installed = true;
        Bridge::new(config)
    });
    installed
}

/// The process-wide bridge, installed with defaults on first use.
pub fn bridge() -> &'static Bridge {
    BRIDGE.get_or_init(|| Bridge::new(BridgeConfig::default()))
}

struct HostConfig {
    get: ConfigGetFn,
    ctx: *mut c_void,
}

impl ConfigLoader for HostConfig {
    fn get(&self, key: &str) -> Option<String> {
        let key = CString::new(key).ok()?;
        // SAFETY: the host guarantees `get` is callable with its own `ctx`.
        let value = unsafe { (self.get)(self.ctx, key.as_ptr()) };
        if value.is_null() {
            return None;
        }
        // SAFETY: non-null values are NUL-terminated and live until the next call.
        let value = unsafe { CStr::from_ptr(value) };
        Some(value.to_string_lossy().into_owned())
    }
}

fn guard<F>(entry: &'static str, f: F) -> c_int
where
    F: FnOnce() -> Status,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status.as_raw(),
        Err(payload) => {
            tracing::error!(entry, panic = %panic_message(payload.as_ref()), "panic at the C boundary");
            Status::Error.as_raw()
        }
    }
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn borrow_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// # Safety
/// `out_data` and `out_len` must be valid for writes.
unsafe fn hand_over(data: Vec<u8>, out_data: *mut *mut u8, out_len: *mut usize) {
    if data.is_empty() {
        return;
    }
    let len = data.len();
    *out_data = Box::into_raw(data.into_boxed_slice()) as *mut u8;
    *out_len = len;
}

/// Report whether a plugin is registered and its direction.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn flb_bridge_plugin_kind(name: *const c_char) -> c_int {
    let Some(name) = borrow_str(name) else {
        return KIND_UNKNOWN;
    };
    panic::catch_unwind(|| match bridge().lookup(name).map(|d| d.kind()) {
        Some(PluginKind::Input) => KIND_INPUT,
        Some(PluginKind::Output) => KIND_OUTPUT,
        None => KIND_UNKNOWN,
    })
    .unwrap_or(KIND_UNKNOWN)
}

/// Initialize a plugin instance.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string. `get_config`,
/// when present, must be safe to call with `ctx` for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn flb_bridge_plugin_init(
    name: *const c_char,
    get_config: Option<ConfigGetFn>,
    ctx: *mut c_void,
) -> c_int {
    let Some(name) = borrow_str(name) else {
        return Status::Error.as_raw();
    };
    guard("init", || match get_config {
        Some(get) => bridge().plugin_init(name, &HostConfig { get, ctx }),
        None => bridge().plugin_init(name, &crate::config::ConfigMap::new()),
    })
}

/// Deliver one host buffer to an output plugin.
///
/// # Safety
/// `name` and `tag` must be null or NUL-terminated strings. `data` must be
/// null with `len == 0`, or valid for reads of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn flb_bridge_plugin_flush(
    name: *const c_char,
    data: *const u8,
    len: usize,
    tag: *const c_char,
) -> c_int {
    let (Some(name), Some(tag)) = (borrow_str(name), borrow_str(tag)) else {
        return Status::Error.as_raw();
    };
    let buf: &[u8] = if data.is_null() {
        if len != 0 {
            return Status::Error.as_raw();
        }
        &[]
    } else {
        std::slice::from_raw_parts(data, len)
    };
    guard("flush", || bridge().plugin_collect(name, tag, buf))
}

/// Collect buffered records from an input plugin.
///
/// On success `*out_data`/`*out_len` receive an encoded buffer, or null/0
/// when nothing is buffered. Release it with [`flb_bridge_buffer_free`].
///
/// # Safety
/// `name` must be null or a NUL-terminated string. `out_data` and `out_len`
/// must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn flb_bridge_plugin_input_collect(
    name: *const c_char,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> c_int {
    if out_data.is_null() || out_len.is_null() {
        return Status::Error.as_raw();
    }
    *out_data = std::ptr::null_mut();
    *out_len = 0;

    let Some(name) = borrow_str(name) else {
        return Status::Error.as_raw();
    };
    guard("input_collect", || {
        let (status, data) = bridge().plugin_input_collect(name);
        hand_over(data, out_data, out_len);
        status
    })
}

/// Release a buffer returned by [`flb_bridge_plugin_input_collect`] or
/// [`flb_bridge_plugin_exit`].
///
/// # Safety
/// `data`/`len` must be exactly a pair returned by one of those calls, freed
/// at most once. Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn flb_bridge_buffer_free(data: *mut u8, len: usize) {
    if data.is_null() {
        return;
    }
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(data, len)));
}

/// Shut down a plugin instance.
///
/// For an input plugin, records still queued at shutdown are returned through
/// `*out_data`/`*out_len` (null/0 when there are none) and must be released
/// with [`flb_bridge_buffer_free`]. Either out pointer may be null when the
/// host has nowhere to route them; the plugin is still shut down and the
/// records are dropped.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string. `out_data` and
/// `out_len` must each be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn flb_bridge_plugin_exit(
    name: *const c_char,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> c_int {
    let wants_data = !out_data.is_null() && !out_len.is_null();
    if wants_data {
        *out_data = std::ptr::null_mut();
        *out_len = 0;
    }

    let Some(name) = borrow_str(name) else {
        return Status::Error.as_raw();
    };
    guard("exit", || {
        let (status, data) = bridge().plugin_exit(name);
        if wants_data {
            hand_over(data, out_data, out_len);
        } else if !data.is_empty() {
            tracing::warn!(plugin = name, bytes = data.len(), "drained records dropped at exit");
        }
        status
    })
}
