//! Plugin capability contracts and registry descriptors.

use std::fmt;
use std::sync::Arc;

use crate::channel::{RecordReceiver, RecordSender};
use crate::config::ConfigLoader;
use crate::context::Context;
use crate::error::PluginResult;

/// An output plugin consumes records from the host.
///
/// Both methods take `&self`; keep per-instance state behind interior
/// mutability (`OnceLock`, `Mutex`).
pub trait OutputPlugin: Send + Sync + 'static {
    /// Prepare the plugin. Runs on the host's calling thread.
    fn init(&self, ctx: &Context, config: &dyn ConfigLoader) -> PluginResult;

    /// Consume one batch of records tagged `tag`.
    ///
    /// Runs on its own thread while the host pushes records. Iterating
    /// `records` ends once the host has pushed the whole batch. After `ctx`
    /// is cancelled the plugin should return once its current record is
    /// processed.
    fn collect(&self, ctx: &Context, tag: &str, records: RecordReceiver) -> PluginResult;
}

/// An input plugin produces records for the host.
pub trait InputPlugin: Send + Sync + 'static {
    /// Prepare the plugin. Runs on the host's calling thread.
    fn init(&self, ctx: &Context, config: &dyn ConfigLoader) -> PluginResult;

    /// Produce records until `ctx` is cancelled.
    ///
    /// Started once per instance on its own thread. A full channel blocks
    /// `records.send` until the host collects.
    fn flush(&self, ctx: &Context, records: RecordSender) -> PluginResult;
}

/// Plugin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    /// Produces records.
    Input,
    /// Consumes records.
    Output,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A registered implementation.
#[derive(Clone)]
pub enum PluginImpl {
    /// Input plugin.
    Input(Arc<dyn InputPlugin>),
    /// Output plugin.
    Output(Arc<dyn OutputPlugin>),
}

impl PluginImpl {
    /// Plugin direction.
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Input(_) => PluginKind::Input,
            Self::Output(_) => PluginKind::Output,
        }
    }
}

impl fmt::Debug for PluginImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginImpl::{}", self.kind())
    }
}

/// Registry entry.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    name: String,
    description: String,
    implementation: PluginImpl,
}

impl PluginDescriptor {
    /// Describe an output plugin.
    pub fn output(
        name: impl Into<String>,
        description: impl Into<String>,
        plugin: impl OutputPlugin,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            implementation: PluginImpl::Output(Arc::new(plugin)),
        }
    }

    /// Describe an input plugin.
    pub fn input(
        name: impl Into<String>,
        description: impl Into<String>,
        plugin: impl InputPlugin,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            implementation: PluginImpl::Input(Arc::new(plugin)),
        }
    }

    /// Unique plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The implementation.
    pub fn implementation(&self) -> &PluginImpl {
        &self.implementation
    }

    /// Plugin direction.
    pub fn kind(&self) -> PluginKind {
        self.implementation.kind()
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<24} {:<6} {}", self.name, self.kind(), self.description)
    }
}
