//! Plugin configuration access and bridge tuning.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Read-only view over host-supplied configuration properties.
///
/// The accessor makes no assumption about key namespaces or value types;
/// plugin code owns conversion and defaults.
pub trait ConfigLoader {
    /// Get the raw string value for `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Get a value, falling back to `default` when the key is absent.
    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Get a value that must be present.
    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| Error::config(format!("missing required key: {}", key)))
    }
}

impl dyn ConfigLoader + '_ {
    /// Get a value and parse it.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| Error::config(format!("invalid value for {}: {:?}: {}", key, raw, e))),
        }
    }
}

/// In-memory configuration with case-insensitive keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMap {
    values: HashMap<String, String>,
}

impl ConfigMap {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs. Later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (normalize(k.as_ref()), v.into()))
            .collect();
        Self { values }
    }

    /// Add a property.
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.values.insert(normalize(key.as_ref()), value.into());
        self
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a flat TOML table. Scalars are stringified.
    #[cfg(feature = "serde")]
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let table: toml::Table = s
            .parse()
            .map_err(|e: toml::de::Error| Error::config(e.to_string()))?;

        let mut values = HashMap::with_capacity(table.len());
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => {
                    return Err(Error::config(format!("key {} must be a scalar", key)));
                }
            };
            values.insert(normalize(&key), value);
        }

        Ok(Self { values })
    }

    /// Load a flat TOML file.
    #[cfg(feature = "serde")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

impl ConfigLoader for ConfigMap {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(&normalize(key)).cloned()
    }
}

impl<T: ConfigLoader + ?Sized> ConfigLoader for &T {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Tuning for the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Capacity of each message channel; `0` makes every send a rendezvous.
    pub channel_capacity: usize,
    /// How long plugin code may run after cancellation.
    pub shutdown_timeout: Duration,
    /// Maximum records encoded per input collect call.
    pub input_batch_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            shutdown_timeout: Duration::from_secs(5),
            input_batch_limit: 300_000,
        }
    }
}

impl BridgeConfig {
    /// Create a new bridge configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the input batch limit.
    pub fn with_input_batch_limit(mut self, limit: usize) -> Self {
        self.input_batch_limit = limit;
        self
    }

    /// Parse from TOML. Missing keys keep their defaults.
    ///
    /// ```toml
    /// channel_capacity = 256
    /// shutdown_timeout_ms = 2000
    /// input_batch_limit = 1000
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_toml_str(s: &str) -> Result<Self> {
        #[derive(serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            channel_capacity: Option<usize>,
            shutdown_timeout_ms: Option<u64>,
            input_batch_limit: Option<usize>,
        }

        let raw: Raw = toml::from_str(s).map_err(|e| Error::config(e.to_string()))?;
        let mut config = Self::default();
        if let Some(capacity) = raw.channel_capacity {
            config.channel_capacity = capacity;
        }
        if let Some(ms) = raw.shutdown_timeout_ms {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = raw.input_batch_limit {
            if limit == 0 {
                return Err(Error::config("input_batch_limit must be positive"));
            }
            config.input_batch_limit = limit;
        }
        Ok(config)
    }
}
