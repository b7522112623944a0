//! Process-wide plugin registry.
//!
//! Plugins register themselves once, before the host asks for them. Entries
//! are never removed; the registry lives as long as the process.

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::plugin::{InputPlugin, OutputPlugin, PluginDescriptor, PluginKind};

/// Configuration for the plugin registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of plugins allowed.
    pub max_plugins: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_plugins: 100 }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of plugins.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }
}

/// Name-keyed table of plugin descriptors.
pub struct PluginRegistry {
    config: RegistryConfig,
    plugins: DashMap<String, Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    /// Create a new plugin registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            plugins: DashMap::new(),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a plugin. The first registration of a name wins.
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<()> {
        let name = descriptor.name().to_string();
        validate_name(&name)?;

        if self.plugins.len() >= self.config.max_plugins {
            return Err(Error::Registry(format!(
                "registry full: max {} plugins",
                self.config.max_plugins
            )));
        }

        match self.plugins.entry(name) {
            Entry::Occupied(entry) => Err(Error::DuplicatePlugin(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    plugin = %descriptor.name(),
                    kind = %descriptor.kind(),
                    "registered plugin"
                );
                entry.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    /// Look up a plugin by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(name).map(|r| r.value().clone())
    }

    /// Check if a plugin exists.
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Get all plugin names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Get all descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<Arc<PluginDescriptor>> {
        let mut all: Vec<_> = self.plugins.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Get descriptors of one kind, sorted by name.
    pub fn by_kind(&self, kind: PluginKind) -> Vec<Arc<PluginDescriptor>> {
        self.descriptors()
            .into_iter()
            .filter(|d| d.kind() == kind)
            .collect()
    }

    /// One line per plugin, for `--help` style listings.
    pub fn listing(&self) -> String {
        self.descriptors()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugin_count", &self.plugins.len())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidPluginName(name.to_string()));
    }
    Ok(())
}

static GLOBAL: OnceLock<Arc<PluginRegistry>> = OnceLock::new();

/// The process-wide registry.
pub fn global() -> Arc<PluginRegistry> {
    GLOBAL
        .get_or_init(|| Arc::new(PluginRegistry::default_config()))
        .clone()
}

/// Register an output plugin in the process-wide registry.
///
/// Call once per plugin during process start, before the host loads it.
/// A duplicate or invalid name is a startup failure.
pub fn register_output(
    name: impl Into<String>,
    description: impl Into<String>,
    plugin: impl OutputPlugin,
) -> Result<()> {
    register_global(PluginDescriptor::output(name, description, plugin))
}

/// Register an input plugin in the process-wide registry.
pub fn register_input(
    name: impl Into<String>,
    description: impl Into<String>,
    plugin: impl InputPlugin,
) -> Result<()> {
    register_global(PluginDescriptor::input(name, description, plugin))
}

fn register_global(descriptor: PluginDescriptor) -> Result<()> {
    let name = descriptor.name().to_string();
    global().register(descriptor).map_err(|e| {
        tracing::error!(plugin = %name, error = %e, "plugin registration failed");
        e
    })
}
