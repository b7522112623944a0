//! Prometheus metrics for bridge traffic.

use prometheus::{Counter, Histogram, HistogramOpts, Registry};

use crate::error::{Error, Result};
use crate::instance::DeliveryReport;

/// Configuration for bridge metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all bridge metrics.
    pub prefix: String,
    /// Whether to collect delivery timing histograms.
    pub detailed_timing: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "flb_bridge".to_string(),
            detailed_timing: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable delivery timing.
    pub fn with_detailed_timing(mut self, enabled: bool) -> Self {
        self.detailed_timing = enabled;
        self
    }
}

/// Bridge metrics collector.
pub struct BridgeMetrics {
    config: MetricsConfig,
    registry: Registry,
    records_decoded: Counter,
    records_delivered: Counter,
    records_collected: Counter,
    decode_errors: Counter,
    plugin_errors: Counter,
    panics: Counter,
    delivery_duration: Histogram,
}

impl BridgeMetrics {
    /// Create a collector and register its metrics in a fresh registry.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let counter = |name: &str, help: &str| {
            Counter::new(format!("{}_{}", config.prefix, name), help).map_err(Error::from)
        };

        let records_decoded = counter("records_decoded_total", "Records decoded from host buffers")?;
        let records_delivered =
            counter("records_delivered_total", "Records accepted by output plugins")?;
        let records_collected =
            counter("records_collected_total", "Records collected from input plugins")?;
        let decode_errors = counter("decode_errors_total", "Host buffers with a malformed entry")?;
        let plugin_errors = counter("plugin_errors_total", "Plugin calls that returned an error")?;
        let panics = counter("panics_total", "Plugin panics caught at the bridge")?;

        let delivery_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_delivery_duration_seconds", config.prefix),
                "Output delivery duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let registry = Registry::new();
        registry.register(Box::new(records_decoded.clone()))?;
        registry.register(Box::new(records_delivered.clone()))?;
        registry.register(Box::new(records_collected.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(plugin_errors.clone()))?;
        registry.register(Box::new(panics.clone()))?;
        registry.register(Box::new(delivery_duration.clone()))?;

        Ok(Self {
            config,
            registry,
            records_decoded,
            records_delivered,
            records_collected,
            decode_errors,
            plugin_errors,
            panics,
            delivery_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a completed output delivery.
    pub fn record_delivery(&self, report: &DeliveryReport) {
        self.records_decoded.inc_by(report.decoded as f64);
        self.records_delivered.inc_by(report.delivered as f64);
        if report.decode_error.is_some() {
            self.decode_errors.inc();
        }
        if self.config.detailed_timing {
            self.delivery_duration.observe(report.duration.as_secs_f64());
        }
    }

    /// Record records collected from an input plugin.
    pub fn record_collected(&self, records: usize) {
        self.records_collected.inc_by(records as f64);
    }

    /// Record a failed plugin call.
    pub fn record_error(&self, error: &Error) {
        self.plugin_errors.inc();
        if matches!(error, Error::PanicContained { .. }) {
            self.panics.inc();
        }
    }

    /// Total records delivered to output plugins.
    pub fn records_delivered_total(&self) -> u64 {
        self.records_delivered.get() as u64
    }

    /// Total records collected from input plugins.
    pub fn records_collected_total(&self) -> u64 {
        self.records_collected.get() as u64
    }

    /// Total failed plugin calls.
    pub fn plugin_errors_total(&self) -> u64 {
        self.plugin_errors.get() as u64
    }

    /// Total contained panics.
    pub fn panics_total(&self) -> u64 {
        self.panics.get() as u64
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMetrics")
            .field("config", &self.config)
            .field("records_delivered", &self.records_delivered_total())
            .field("records_collected", &self.records_collected_total())
            .field("plugin_errors", &self.plugin_errors_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_config_builder() {
        let config = MetricsConfig::new()
            .with_prefix("test")
            .with_detailed_timing(false);

        assert_eq!(config.prefix, "test");
        assert!(!config.detailed_timing);
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = BridgeMetrics::new(MetricsConfig::default()).unwrap();

        metrics.record_delivery(&DeliveryReport {
            decoded: 4,
            delivered: 3,
            duration: Duration::from_millis(2),
            ..Default::default()
        });
        metrics.record_collected(5);
        metrics.record_error(&Error::collect_failed("out", "boom"));
        metrics.record_error(&Error::panic_contained("out", "collect", "boom"));

        assert_eq!(metrics.records_delivered_total(), 3);
        assert_eq!(metrics.records_collected_total(), 5);
        assert_eq!(metrics.plugin_errors_total(), 2);
        assert_eq!(metrics.panics_total(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let result = BridgeMetrics::new(MetricsConfig::new().with_prefix("bad prefix"));
        assert!(matches!(result, Err(Error::Metrics(_))));
    }
}
