//! Integration tests for flb-bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flb_bridge::{
    channel, decode_batch, encode_record, Bridge, BridgeConfig, ConfigLoader, ConfigMap, Context,
    Error, InputPlugin, LifecycleState, OutputPlugin, PluginDescriptor, PluginRegistry,
    PluginResult, Received, Record, RecordReceiver, RecordSender, SendError, Status, Value,
};
use parking_lot::Mutex;

fn encode(tag: &str, range: std::ops::Range<i64>) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in range {
        encode_record(&Record::now(tag).with_field("i", i), &mut buf).unwrap();
    }
    buf
}

fn index(record: &Record) -> i64 {
    record.get("i").and_then(Value::as_i64).unwrap()
}

// Output plugin that records every index it sees, optionally slowly.
struct Recorder {
    seen: Arc<Mutex<Vec<i64>>>,
    delay: Duration,
}

impl Recorder {
    fn new(delay: Duration) -> (Self, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                seen: seen.clone(),
                delay,
            },
            seen,
        )
    }
}

impl OutputPlugin for Recorder {
    fn init(&self, _ctx: &Context, config: &dyn ConfigLoader) -> PluginResult {
        if config.get("fail").is_some() {
            return Err("refusing to start".into());
        }
        Ok(())
    }

    fn collect(&self, _ctx: &Context, _tag: &str, records: RecordReceiver) -> PluginResult {
        for record in records {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.seen.lock().push(index(&record));
        }
        Ok(())
    }
}

// Consumes one record, then waits for cancellation.
struct Stubborn {
    consumed: Arc<AtomicUsize>,
}

impl OutputPlugin for Stubborn {
    fn init(&self, _ctx: &Context, _config: &dyn ConfigLoader) -> PluginResult {
        Ok(())
    }

    fn collect(&self, ctx: &Context, _tag: &str, records: RecordReceiver) -> PluginResult {
        if let Received::Record(_) = records.recv_or_cancel(ctx) {
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
        ctx.wait();
        Ok(())
    }
}

struct Explosive;

impl OutputPlugin for Explosive {
    fn init(&self, _ctx: &Context, _config: &dyn ConfigLoader) -> PluginResult {
        Ok(())
    }

    fn collect(&self, _ctx: &Context, _tag: &str, records: RecordReceiver) -> PluginResult {
        for record in records {
            if record.get("boom").is_some() {
                panic!("plugin bug");
            }
        }
        Ok(())
    }
}

// Emits `count` records as fast as the channel allows, then idles.
struct Burst {
    count: i64,
}

impl InputPlugin for Burst {
    fn init(&self, _ctx: &Context, _config: &dyn ConfigLoader) -> PluginResult {
        Ok(())
    }

    fn flush(&self, ctx: &Context, records: RecordSender) -> PluginResult {
        for i in 0..self.count {
            match records.send(ctx, Record::now("burst").with_field("i", i)) {
                Ok(()) => {}
                Err(SendError::Cancelled(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        ctx.wait();
        Ok(())
    }
}

fn bridge_with(config: BridgeConfig, plugins: Vec<PluginDescriptor>) -> Bridge {
    let registry = Arc::new(PluginRegistry::default_config());
    for descriptor in plugins {
        registry.register(descriptor).unwrap();
    }
    Bridge::with_registry(config, registry)
}

#[test]
fn test_registry_first_registration_wins() {
    let registry = PluginRegistry::default_config();
    let (first, _) = Recorder::new(Duration::ZERO);
    let (second, _) = Recorder::new(Duration::ZERO);

    registry
        .register(PluginDescriptor::output("out", "first", first))
        .unwrap();
    let err = registry
        .register(PluginDescriptor::output("out", "second", second))
        .unwrap_err();

    assert!(err.is_registration());
    assert_eq!(registry.lookup("out").unwrap().description(), "first");
}

#[test]
fn test_order_preserved_across_batches() {
    let (plugin, seen) = Recorder::new(Duration::ZERO);
    let bridge = bridge_with(
        BridgeConfig::new().with_channel_capacity(3),
        vec![PluginDescriptor::output("out", "", plugin)],
    );
    bridge.init("out", &ConfigMap::new()).unwrap();

    for start in [0, 100, 200] {
        let status = bridge.plugin_collect("out", "t", &encode("t", start..start + 50));
        assert_eq!(status, Status::Ok);
    }

    let expected: Vec<i64> = (0..50).chain(100..150).chain(200..250).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_malformed_entry_delivers_prefix_only() {
    let (plugin, seen) = Recorder::new(Duration::ZERO);
    let bridge = bridge_with(
        BridgeConfig::default(),
        vec![PluginDescriptor::output("out", "", plugin)],
    );
    bridge.init("out", &ConfigMap::new()).unwrap();

    let mut buf = encode("t", 0..4);
    // fixarray of two elements whose timestamp is a string
    buf.extend_from_slice(&[0x92, 0xa1, b'x', 0x80]);
    buf.extend_from_slice(&encode("t", 4..8));

    let report = bridge.deliver("out", "t", &buf).unwrap();
    assert_eq!(report.delivered, 4);
    assert_eq!(report.decode_error.as_ref().map(|e| e.index), Some(4));
    assert_eq!(Status::from(&report), Status::Ok);
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn test_slow_consumer_blocks_host() {
    let (plugin, seen) = Recorder::new(Duration::from_millis(5));
    let bridge = bridge_with(
        BridgeConfig::new().with_channel_capacity(1),
        vec![PluginDescriptor::output("slow", "", plugin)],
    );
    bridge.init("slow", &ConfigMap::new()).unwrap();

    let report = bridge.deliver("slow", "t", &encode("t", 0..20)).unwrap();

    assert_eq!(report.delivered, 20);
    assert_eq!(seen.lock().len(), 20);
    assert!(report.blocked_sends > 0);
}

#[test]
fn test_cancellation_during_delivery_is_bounded() {
    let consumed = Arc::new(AtomicUsize::new(0));
    let timeout = Duration::from_millis(200);
    let bridge = Arc::new(bridge_with(
        BridgeConfig::new()
            .with_channel_capacity(1)
            .with_shutdown_timeout(timeout),
        vec![PluginDescriptor::output(
            "stubborn",
            "",
            Stubborn {
                consumed: consumed.clone(),
            },
        )],
    ));
    bridge.init("stubborn", &ConfigMap::new()).unwrap();

    let delivery = {
        let bridge = bridge.clone();
        thread::spawn(move || bridge.deliver("stubborn", "t", &encode("t", 0..10)))
    };

    while consumed.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(5));
    }

    let started = Instant::now();
    let shutdown = bridge.exit("stubborn").unwrap();
    let report = delivery.join().unwrap().unwrap();

    assert!(started.elapsed() < timeout * 3);
    assert!(!shutdown.timed_out);
    assert!(report.cancelled);
    assert!(report.delivered < 10);
    assert!(report.undelivered() > 0);
    assert_eq!(consumed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panic_is_contained() {
    let (healthy, seen) = Recorder::new(Duration::ZERO);
    let bridge = bridge_with(
        BridgeConfig::default(),
        vec![
            PluginDescriptor::output("explosive", "", Explosive),
            PluginDescriptor::output("healthy", "", healthy),
        ],
    );
    bridge.init("explosive", &ConfigMap::new()).unwrap();
    bridge.init("healthy", &ConfigMap::new()).unwrap();

    let mut buf = Vec::new();
    encode_record(&Record::now("t").with_field("boom", true), &mut buf).unwrap();

    let err = bridge.deliver("explosive", "t", &buf).unwrap_err();
    assert!(matches!(err, Error::PanicContained { stage: "collect", .. }));
    assert_eq!(bridge.plugin_collect("explosive", "t", &buf), Status::Error);

    // Neither the failing instance nor its neighbour is poisoned.
    assert_eq!(bridge.plugin_collect("explosive", "t", &encode("t", 0..3)), Status::Ok);
    assert_eq!(bridge.plugin_collect("healthy", "t", &encode("t", 0..3)), Status::Ok);
    assert_eq!(*seen.lock(), vec![0, 1, 2]);
}

#[test]
fn test_failed_init_forbids_delivery() {
    let (plugin, seen) = Recorder::new(Duration::ZERO);
    let bridge = bridge_with(
        BridgeConfig::default(),
        vec![PluginDescriptor::output("out", "", plugin)],
    );

    let err = bridge
        .init("out", &ConfigMap::new().with("FAIL", "1"))
        .unwrap_err();
    assert!(matches!(err, Error::InitFailed { .. }));
    assert_eq!(bridge.instance("out").unwrap().state(), LifecycleState::Failed);

    assert_eq!(bridge.plugin_collect("out", "t", &encode("t", 0..2)), Status::Error);
    assert!(seen.lock().is_empty());
}

#[test]
fn test_input_shutdown_drains_buffered_records() {
    let bridge = bridge_with(
        BridgeConfig::new().with_channel_capacity(16),
        vec![PluginDescriptor::input("burst", "", Burst { count: 8 })],
    );
    bridge.init("burst", &ConfigMap::new()).unwrap();

    // Starts the worker; may or may not see records yet.
    let first = bridge.collect_input("burst").unwrap();
    thread::sleep(Duration::from_millis(50));

    let report = bridge.exit("burst").unwrap();
    assert!(!report.timed_out);

    let mut records = decode_batch("burst", &first.data).records;
    records.extend(decode_batch("burst", &report.drained.data).records);
    let got: Vec<i64> = records.iter().map(index).collect();
    assert_eq!(got, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_input_batch_limit() {
    let bridge = bridge_with(
        BridgeConfig::new()
            .with_channel_capacity(16)
            .with_input_batch_limit(3),
        vec![PluginDescriptor::input("burst", "", Burst { count: 8 })],
    );
    bridge.init("burst", &ConfigMap::new()).unwrap();

    let mut got = Vec::new();
    let started = Instant::now();
    while got.len() < 8 && started.elapsed() < Duration::from_secs(5) {
        let batch = bridge.collect_input("burst").unwrap();
        assert!(batch.records <= 3);
        got.extend(decode_batch("burst", &batch.data).records.iter().map(index));
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(got, (0..8).collect::<Vec<_>>());
    bridge.exit("burst").unwrap();
}

#[test]
fn test_channel_send_returns_record_on_cancel() {
    let ctx = Context::new();
    let (tx, _rx) = channel(0);
    ctx.cancel();

    let err = tx.send(&ctx, Record::now("t").with_field("i", 9i64)).unwrap_err();
    assert_eq!(index(&err.into_record()), 9);
}

#[test]
fn test_context_deadline() {
    let ctx = Context::with_timeout(Duration::from_millis(20));
    assert!(!ctx.is_cancelled());

    ctx.wait();
    assert!(ctx.is_cancelled());
    assert_eq!(ctx.reason(), Some(flb_bridge::CancelReason::DeadlineExceeded));
}

#[test]
fn test_config_keys_case_insensitive() {
    let config = ConfigMap::from_pairs([("Interval_MS", "250"), ("Path", "/tmp/out")]);
    let config: &dyn ConfigLoader = &config;

    assert_eq!(config.get("interval_ms").as_deref(), Some("250"));
    assert_eq!(config.get("PATH").as_deref(), Some("/tmp/out"));
    assert_eq!(config.get_parsed::<u64>("interval_ms").unwrap(), Some(250));
    assert!(config.get("missing").is_none());
}
