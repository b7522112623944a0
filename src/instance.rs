//! Per-instance lifecycle coordination.
//!
//! A [`PluginInstance`] owns the context handed to plugin code, the state
//! machine, and the threads plugin code runs on. Plugin code never runs
//! unguarded: every call goes through `catch_unwind`, and every wait on it
//! after cancellation is bounded by the shutdown timeout.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::channel::{channel, RecordReceiver, SendError};
use crate::codec::{DecodeError, Decoder, Encoder};
use crate::config::{BridgeConfig, ConfigLoader};
use crate::context::Context;
use crate::error::{panic_message, Error, Result};
use crate::lifecycle::{LifecycleHooks, LifecycleState};
use crate::plugin::{InputPlugin, OutputPlugin, PluginDescriptor, PluginImpl, PluginKind};

/// Outcome of one output delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Records decoded from the buffer.
    pub decoded: usize,
    /// Records accepted by the plugin's channel.
    pub delivered: usize,
    /// Error that stopped decoding, if any.
    pub decode_error: Option<DecodeError>,
    /// Pushes that found the channel full and had to wait.
    pub blocked_sends: u64,
    /// The instance was cancelled during delivery.
    pub cancelled: bool,
    /// Wall time from first push to plugin return.
    pub duration: Duration,
}

impl DeliveryReport {
    /// Decoded records that never reached the plugin.
    pub fn undelivered(&self) -> usize {
        self.decoded - self.delivered
    }
}

/// Records collected from an input plugin, encoded for the host.
#[derive(Debug, Clone, Default)]
pub struct InputBatch {
    /// Encoded MessagePack entries.
    pub data: Vec<u8>,
    /// Number of records in `data`.
    pub records: usize,
}

/// Outcome of shutting an instance down.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Input records still buffered at shutdown, encoded for the host.
    pub drained: InputBatch,
    /// Plugin code did not return within the shutdown timeout.
    pub timed_out: bool,
    /// Error returned by the input worker, if it failed.
    pub error: Option<Error>,
}

struct InputWorker {
    records: RecordReceiver,
    outcome: Receiver<Result<()>>,
    exited: bool,
}

/// One live plugin instance.
pub struct PluginInstance {
    descriptor: Arc<PluginDescriptor>,
    settings: BridgeConfig,
    ctx: Context,
    state: RwLock<LifecycleState>,
    hooks: Arc<RwLock<LifecycleHooks>>,
    inflight: Mutex<usize>,
    idle: Condvar,
    input: Mutex<Option<InputWorker>>,
}

impl PluginInstance {
    /// Create an instance in the `Created` state.
    pub fn new(
        descriptor: Arc<PluginDescriptor>,
        settings: BridgeConfig,
        hooks: Arc<RwLock<LifecycleHooks>>,
    ) -> Self {
        Self {
            descriptor,
            settings,
            ctx: Context::new(),
            state: RwLock::new(LifecycleState::Created),
            hooks,
            inflight: Mutex::new(0),
            idle: Condvar::new(),
            input: Mutex::new(None),
        }
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Plugin direction.
    pub fn kind(&self) -> PluginKind {
        self.descriptor.kind()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// The context handed to plugin code.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run plugin `init` on the calling thread.
    ///
    /// Failure is terminal: the instance moves to `Failed` and rejects every
    /// later delivery.
    pub fn init(&self, config: &dyn ConfigLoader) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.can_init() {
                return Err(Error::invalid_state("created", state.to_string()));
            }
            *state = LifecycleState::Initializing;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            match self.descriptor.implementation() {
                PluginImpl::Output(p) => p.init(&self.ctx, config),
                PluginImpl::Input(p) => p.init(&self.ctx, config),
            }
        }));

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::init_failed(self.name(), e)),
            Err(payload) => Err(Error::panic_contained(
                self.name(),
                "init",
                panic_message(payload.as_ref()),
            )),
        };

        match &result {
            Ok(()) => {
                *self.state.write() = LifecycleState::Running;
                tracing::info!(plugin = %self.name(), kind = %self.kind(), "plugin initialized");
                self.hooks.read().emit_initialized(self.name());
            }
            Err(e) => {
                *self.state.write() = LifecycleState::Failed;
                self.ctx.cancel();
                tracing::error!(plugin = %self.name(), error = %e, "plugin init failed");
                self.hooks.read().emit_init_failed(self.name(), &e.to_string());
            }
        }

        result
    }

    /// Deliver one host buffer to an output plugin.
    ///
    /// The plugin's `collect` runs on its own thread while this thread decodes
    /// and pushes. A full channel blocks this thread. Once the context is
    /// cancelled, pushing continues for at most the shutdown timeout.
    pub fn deliver(&self, tag: &str, buf: &[u8]) -> Result<DeliveryReport> {
        let plugin = self.output_plugin()?;
        let _inflight = self.begin_delivery()?;
        let started = Instant::now();
        let timeout = self.settings.shutdown_timeout;

        let (tx, rx) = channel(self.settings.channel_capacity);
        let outcome = {
            let ctx = self.ctx.clone();
            let tag = tag.to_string();
            let name = self.name().to_string();
            spawn_guarded(self.name(), "collect", move || {
                plugin
                    .collect(&ctx, &tag, rx)
                    .map_err(|e| Error::collect_failed(name, e))
            })?
        };

        let mut report = DeliveryReport::default();
        let mut grace: Option<Instant> = None;

        for item in Decoder::new(tag, buf) {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(plugin = %self.name(), tag, error = %e, "dropping malformed suffix of batch");
                    report.decode_error = Some(e);
                    break;
                }
            };
            report.decoded += 1;

            let sent = match grace {
                None => match tx.send(&self.ctx, record) {
                    Err(SendError::Cancelled(record)) => {
                        let deadline = Instant::now() + timeout;
                        grace = Some(deadline);
                        report.cancelled = true;
                        tx.send_deadline(record, deadline)
                    }
                    other => other,
                },
                Some(deadline) => tx.send_deadline(record, deadline),
            };

            match sent {
                Ok(()) => report.delivered += 1,
                Err(SendError::Closed(_)) => {
                    tracing::debug!(plugin = %self.name(), "collect returned before the batch was pushed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(plugin = %self.name(), "shutdown grace expired while pushing records");
                    break;
                }
            }
        }
        report.blocked_sends = tx.stats().blocked_sends;
        drop(tx);

        let result = self.wait_worker(&outcome, grace);
        report.duration = started.elapsed();
        report.cancelled |= self.ctx.is_cancelled();

        match result {
            Ok(()) => {
                tracing::debug!(
                    plugin = %self.name(),
                    tag,
                    delivered = report.delivered,
                    undelivered = report.undelivered(),
                    "batch delivered"
                );
                self.hooks.read().emit_batch_delivered(self.name(), report.delivered);
                Ok(report)
            }
            Err(e) => {
                tracing::error!(plugin = %self.name(), tag, error = %e, "collect failed");
                self.hooks.read().emit_error(self.name(), &e.to_string());
                Err(e)
            }
        }
    }

    /// Collect whatever an input plugin has buffered, encoded for the host.
    ///
    /// The first call starts the plugin's `flush` on its own thread. Never
    /// waits for records.
    pub fn collect_input(&self) -> Result<InputBatch> {
        let plugin = self.input_plugin()?;
        {
            let state = self.state.read();
            if !state.can_deliver() {
                return Err(Error::invalid_state("running", state.to_string()));
            }
        }

        let mut slot = self.input.lock();
        if slot.is_none() {
            *slot = Some(self.start_input(plugin)?);
        }
        let Some(worker) = slot.as_mut() else {
            return Err(Error::invalid_state("input worker started", "no worker"));
        };

        let batch = encode_buffered(&worker.records, self.settings.input_batch_limit)?;
        if batch.records > 0 {
            self.hooks.read().emit_batch_delivered(self.name(), batch.records);
            return Ok(batch);
        }

        // Surface a failed worker only once its buffered records are gone.
        if !worker.exited {
            match worker.outcome.try_recv() {
                Ok(result) => {
                    worker.exited = true;
                    if let Err(e) = result {
                        tracing::error!(plugin = %self.name(), error = %e, "flush failed");
                        self.hooks.read().emit_error(self.name(), &e.to_string());
                        return Err(e);
                    }
                    tracing::debug!(plugin = %self.name(), "flush returned");
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => worker.exited = true,
            }
        }

        Ok(batch)
    }

    /// Cancel the instance, wait for plugin code, and drain input records.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        {
            let mut state = self.state.write();
            let current = *state;
            if current == LifecycleState::Terminated {
                return Ok(ShutdownReport::default());
            }
            if !current.can_shutdown() {
                return Err(Error::invalid_state("running", current.to_string()));
            }
            if current != LifecycleState::Running {
                *state = LifecycleState::Terminated;
                drop(state);
                self.ctx.cancel();
                self.hooks.read().emit_terminated(self.name());
                return Ok(ShutdownReport::default());
            }
            *state = LifecycleState::Draining;
        }

        let timeout = self.settings.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        self.ctx.cancel();
        tracing::info!(plugin = %self.name(), "plugin cancelled, draining");
        self.hooks.read().emit_cancelled(self.name());

        let mut report = ShutdownReport::default();

        {
            let mut inflight = self.inflight.lock();
            while *inflight > 0 {
                if self.idle.wait_until(&mut inflight, deadline).timed_out() {
                    report.timed_out = true;
                    break;
                }
            }
        }

        if let Some(worker) = self.input.lock().take() {
            if !worker.exited {
                match self.wait_worker(&worker.outcome, Some(deadline)) {
                    Ok(()) => {}
                    Err(Error::ShutdownTimeout { .. }) => report.timed_out = true,
                    Err(e) => report.error = Some(e),
                }
            }
            report.drained = encode_buffered(&worker.records, usize::MAX)?;
        }

        *self.state.write() = LifecycleState::Stopped;
        if report.timed_out {
            tracing::warn!(plugin = %self.name(), ?timeout, "plugin did not stop in time");
        }
        self.hooks.read().emit_stopped(self.name());

        *self.state.write() = LifecycleState::Terminated;
        tracing::info!(
            plugin = %self.name(),
            drained = report.drained.records,
            "plugin terminated"
        );
        self.hooks.read().emit_terminated(self.name());

        Ok(report)
    }

    fn output_plugin(&self) -> Result<Arc<dyn OutputPlugin>> {
        match self.descriptor.implementation() {
            PluginImpl::Output(p) => Ok(p.clone()),
            PluginImpl::Input(_) => Err(self.kind_mismatch(PluginKind::Output)),
        }
    }

    fn input_plugin(&self) -> Result<Arc<dyn InputPlugin>> {
        match self.descriptor.implementation() {
            PluginImpl::Input(p) => Ok(p.clone()),
            PluginImpl::Output(_) => Err(self.kind_mismatch(PluginKind::Input)),
        }
    }

    fn kind_mismatch(&self, expected: PluginKind) -> Error {
        Error::KindMismatch {
            name: self.name().to_string(),
            expected: expected.to_string(),
            actual: self.kind().to_string(),
        }
    }

    fn begin_delivery(&self) -> Result<InflightGuard<'_>> {
        let state = self.state.read();
        if !state.can_deliver() {
            return Err(Error::invalid_state("running", state.to_string()));
        }
        *self.inflight.lock() += 1;
        Ok(InflightGuard { instance: self })
    }

    fn start_input(&self, plugin: Arc<dyn InputPlugin>) -> Result<InputWorker> {
        let (tx, records) = channel(self.settings.channel_capacity);
        let ctx = self.ctx.clone();
        let name = self.name().to_string();
        let outcome = spawn_guarded(self.name(), "flush", move || {
            plugin
                .flush(&ctx, tx)
                .map_err(|e| Error::flush_failed(name, e))
        })?;
        tracing::debug!(plugin = %self.name(), "input worker started");

        Ok(InputWorker {
            records,
            outcome,
            exited: false,
        })
    }

    /// Wait for a worker's result.
    ///
    /// Unbounded while the context is live. Once it is cancelled the wait ends
    /// at `deadline`, or one shutdown timeout after cancellation is seen.
    fn wait_worker(&self, outcome: &Receiver<Result<()>>, deadline: Option<Instant>) -> Result<()> {
        let deadline = match deadline {
            Some(deadline) => deadline,
            None => {
                if !self.ctx.is_cancelled() {
                    select! {
                        recv(outcome) -> result => return flatten_outcome(self.name(), result.ok()),
                        recv(self.ctx.done_ref()) -> _ => {}
                    }
                }
                Instant::now() + self.settings.shutdown_timeout
            }
        };

        let timeout = deadline.saturating_duration_since(Instant::now());
        match outcome.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::ShutdownTimeout {
                plugin: self.name().to_string(),
                timeout: self.settings.shutdown_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => flatten_outcome(self.name(), None),
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        // Release any plugin thread still waiting on the context.
        self.ctx.cancel();
    }
}

struct InflightGuard<'a> {
    instance: &'a PluginInstance,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.instance.inflight.lock();
        *inflight -= 1;
        if *inflight == 0 {
            self.instance.idle.notify_all();
        }
    }
}

/// Run plugin code on a named thread, converting a panic into an error.
fn spawn_guarded<F>(plugin: &str, stage: &'static str, f: F) -> Result<Receiver<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let name = plugin.to_string();

    std::thread::Builder::new()
        .name(format!("{}-{}", plugin, stage))
        .spawn(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(plugin = %name, stage, panic = %message, "plugin panicked");
                    Err(Error::panic_contained(name, stage, message))
                }
            };
            let _ = tx.send(result);
        })?;

    Ok(rx)
}

fn flatten_outcome(plugin: &str, result: Option<Result<()>>) -> Result<()> {
    match result {
        Some(result) => result,
        None => Err(Error::panic_contained(
            plugin,
            "worker",
            "worker exited without reporting a result",
        )),
    }
}

fn encode_buffered(records: &RecordReceiver, limit: usize) -> Result<InputBatch> {
    let mut encoder = Encoder::new();
    for record in records.drain().take(limit) {
        encoder.encode(&record)?;
    }
    let count = encoder.len();
    Ok(InputBatch {
        data: encoder.finish(),
        records: count,
    })
}
