//! Host-facing entry points.
//!
//! The host drives a plugin with four calls: init, collect (flush for output
//! plugins), input collect, and exit. [`Bridge`] maps each call onto a live
//! [`PluginInstance`] and reduces the outcome to a host [`Status`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::{BridgeConfig, ConfigLoader};
use crate::error::{Error, Result};
use crate::instance::{DeliveryReport, InputBatch, PluginInstance, ShutdownReport};
use crate::lifecycle::{LifecycleEvent, LifecycleHooks, LifecycleState};
use crate::plugin::PluginDescriptor;
use crate::registry::{self, PluginRegistry};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::BridgeMetrics;

/// Result code returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// The call failed; the host drops the batch.
    Error = 0,
    /// The call succeeded.
    Ok = 1,
    /// Nothing was consumed; the host may resend the batch.
    Retry = 2,
}

impl Status {
    /// Raw host code.
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl From<&DeliveryReport> for Status {
    fn from(report: &DeliveryReport) -> Self {
        if report.undelivered() == 0 {
            Status::Ok
        } else if report.delivered == 0 {
            Status::Retry
        } else {
            Status::Error
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Ok => write!(f, "ok"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Routes host calls to plugin instances.
pub struct Bridge {
    config: BridgeConfig,
    registry: Arc<PluginRegistry>,
    instances: DashMap<String, Arc<PluginInstance>>,
    hooks: Arc<RwLock<LifecycleHooks>>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<BridgeMetrics>>,
}

impl Bridge {
    /// Create a bridge over the process-wide registry.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_registry(config, registry::global())
    }

    /// Create a bridge over a specific registry.
    pub fn with_registry(config: BridgeConfig, registry: Arc<PluginRegistry>) -> Self {
        Self {
            config,
            registry,
            instances: DashMap::new(),
            hooks: Arc::new(RwLock::new(LifecycleHooks::new())),
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    /// Attach a metrics collector.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get the plugin registry.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.hooks.write().on_event(handler);
    }

    /// Describe a registered plugin.
    pub fn lookup(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.registry.lookup(name)
    }

    /// Get the live instance for a plugin.
    pub fn instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.instances.get(name).map(|r| r.value().clone())
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Create and initialize an instance of a registered plugin.
    ///
    /// A failed instance stays in place, rejecting calls, until `exit`.
    pub fn init(&self, name: &str, config: &dyn ConfigLoader) -> Result<()> {
        let descriptor = self
            .registry
            .lookup(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;

        let instance = match self.instances.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                return Err(Error::invalid_state(
                    "created",
                    entry.get().state().to_string(),
                ))
            }
            Entry::Vacant(entry) => {
                let instance = Arc::new(PluginInstance::new(
                    descriptor,
                    self.config.clone(),
                    self.hooks.clone(),
                ));
                entry.insert(instance.clone());
                instance
            }
        };

        let result = instance.init(config);
        #[cfg(feature = "metrics-prometheus")]
        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            metrics.record_error(e);
        }
        result
    }

    /// Deliver a host buffer to an output plugin.
    pub fn deliver(&self, name: &str, tag: &str, buf: &[u8]) -> Result<DeliveryReport> {
        let instance = self.live(name)?;
        let result = instance.deliver(tag, buf);

        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(report) => metrics.record_delivery(report),
                Err(e) => metrics.record_error(e),
            }
        }

        result
    }

    /// Collect buffered records from an input plugin.
    pub fn collect_input(&self, name: &str) -> Result<InputBatch> {
        let instance = self.live(name)?;
        let result = instance.collect_input();

        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(batch) => metrics.record_collected(batch.records),
                Err(e) => metrics.record_error(e),
            }
        }

        result
    }

    /// Shut down and release a plugin's instance.
    ///
    /// Exiting a registered plugin with no live instance is a no-op. An
    /// instance whose init is still running is left in place and the call
    /// fails with `InvalidState`.
    pub fn exit(&self, name: &str) -> Result<ShutdownReport> {
        let removed = self
            .instances
            .remove_if(name, |_, instance| instance.state() != LifecycleState::Initializing);

        match removed {
            Some((key, instance)) => match instance.shutdown() {
                Err(e @ Error::InvalidState { .. }) => {
                    self.instances.entry(key).or_insert(instance);
                    Err(e)
                }
                result => result,
            },
            None => match self.instance(name) {
                Some(instance) => Err(Error::invalid_state(
                    "running",
                    instance.state().to_string(),
                )),
                None if self.registry.contains(name) => Ok(ShutdownReport::default()),
                None => Err(Error::plugin_not_found(name)),
            },
        }
    }

    /// Shut down every live instance.
    pub fn exit_all(&self) -> Vec<(String, Result<ShutdownReport>)> {
        let mut names: Vec<String> = self.instances.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let result = self.exit(&name);
                (name, result)
            })
            .collect()
    }

    /// Host init entry point.
    pub fn plugin_init(&self, name: &str, config: &dyn ConfigLoader) -> Status {
        match self.init(name, config) {
            Ok(()) => Status::Ok,
            Err(e) => {
                tracing::error!(plugin = name, error = %e, "init rejected");
                Status::Error
            }
        }
    }

    /// Host flush entry point for output plugins.
    pub fn plugin_collect(&self, name: &str, tag: &str, buf: &[u8]) -> Status {
        match self.deliver(name, tag, buf) {
            Ok(report) => {
                let status = Status::from(&report);
                if status != Status::Ok {
                    tracing::warn!(
                        plugin = name,
                        tag,
                        undelivered = report.undelivered(),
                        %status,
                        "batch not fully delivered"
                    );
                }
                status
            }
            Err(e) => {
                tracing::error!(plugin = name, tag, error = %e, "flush failed");
                Status::Error
            }
        }
    }

    /// Host collect entry point for input plugins.
    pub fn plugin_input_collect(&self, name: &str) -> (Status, Vec<u8>) {
        match self.collect_input(name) {
            Ok(batch) => (Status::Ok, batch.data),
            Err(e) => {
                tracing::error!(plugin = name, error = %e, "input collect failed");
                (Status::Error, Vec::new())
            }
        }
    }

    /// Host exit entry point.
    ///
    /// For input plugins the returned buffer holds the records still queued
    /// at shutdown. It is handed back even when the status is `Error`.
    pub fn plugin_exit(&self, name: &str) -> (Status, Vec<u8>) {
        match self.exit(name) {
            Ok(report) => {
                if let Some(e) = &report.error {
                    tracing::error!(plugin = name, error = %e, "plugin failed during shutdown");
                }
                if report.drained.records > 0 {
                    tracing::debug!(
                        plugin = name,
                        records = report.drained.records,
                        "returning drained records"
                    );
                }
                let status = if report.timed_out || report.error.is_some() {
                    Status::Error
                } else {
                    Status::Ok
                };
                (status, report.drained.data)
            }
            Err(e) => {
                tracing::error!(plugin = name, error = %e, "exit failed");
                (Status::Error, Vec::new())
            }
        }
    }

    fn live(&self, name: &str) -> Result<Arc<PluginInstance>> {
        match self.instance(name) {
            Some(instance) => Ok(instance),
            None if self.registry.contains(name) => {
                Err(Error::invalid_state("running", "not initialized"))
            }
            None => Err(Error::plugin_not_found(name)),
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("plugin_count", &self.registry.len())
            .field("instance_count", &self.instances.len())
            .finish()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        for (name, result) in self.exit_all() {
            if let Err(e) = result {
                tracing::warn!(plugin = %name, error = %e, "exit during drop failed");
            }
        }
    }
}
