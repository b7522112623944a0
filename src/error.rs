//! Error types for bridge operations.

use std::time::Duration;

use thiserror::Error;

use crate::codec::DecodeError;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by plugin code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by plugin `init`, `collect` and `flush` calls.
pub type PluginResult = std::result::Result<(), BoxError>;

/// Errors that can occur while bridging host calls to plugin code.
#[derive(Error, Debug)]
pub enum Error {
    /// Plugin name is empty or contains invalid characters.
    #[error("invalid plugin name: {0:?}")]
    InvalidPluginName(String),

    /// A plugin with this name is already registered.
    #[error("plugin already registered: {0}")]
    DuplicatePlugin(String),

    /// Plugin not found.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin exists but is of the wrong kind for the call.
    #[error("plugin {name} is an {actual} plugin, expected {expected}")]
    KindMismatch {
        /// Plugin name.
        name: String,
        /// Kind the call required.
        expected: String,
        /// Kind of the registered plugin.
        actual: String,
    },

    /// Malformed entry in a host buffer.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Record could not be encoded for the host.
    #[error("encode error: {0}")]
    Encode(String),

    /// Plugin `init` returned an error.
    #[error("plugin {plugin} initialization failed: {message}")]
    InitFailed {
        /// Plugin name.
        plugin: String,
        /// Error message from plugin code.
        message: String,
    },

    /// Output plugin `collect` returned an error.
    #[error("plugin {plugin} collect failed: {message}")]
    CollectFailed {
        /// Plugin name.
        plugin: String,
        /// Error message from plugin code.
        message: String,
    },

    /// Input plugin `flush` returned an error.
    #[error("plugin {plugin} flush failed: {message}")]
    FlushFailed {
        /// Plugin name.
        plugin: String,
        /// Error message from plugin code.
        message: String,
    },

    /// Plugin code panicked; the panic was caught at the bridge.
    #[error("plugin {plugin} panicked during {stage}: {message}")]
    PanicContained {
        /// Plugin name.
        plugin: String,
        /// Lifecycle stage that panicked.
        stage: &'static str,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// Plugin instance is in the wrong state for the operation.
    #[error("invalid plugin state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Plugin code did not return within the shutdown bound.
    #[error("plugin {plugin} did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Plugin name.
        plugin: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Metrics error.
    #[cfg(feature = "metrics-prometheus")]
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create an initialization failed error.
    pub fn init_failed(plugin: impl Into<String>, message: impl ToString) -> Self {
        Self::InitFailed {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }

    /// Create a collect failed error.
    pub fn collect_failed(plugin: impl Into<String>, message: impl ToString) -> Self {
        Self::CollectFailed {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }

    /// Create a flush failed error.
    pub fn flush_failed(plugin: impl Into<String>, message: impl ToString) -> Self {
        Self::FlushFailed {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }

    /// Create a contained panic error.
    pub fn panic_contained(
        plugin: impl Into<String>,
        stage: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::PanicContained {
            plugin: plugin.into(),
            stage,
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns true if this error was raised while registering a plugin.
    ///
    /// Registration errors are fatal at startup.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Self::InvalidPluginName(_) | Self::DuplicatePlugin(_) | Self::Registry(_)
        )
    }

    /// Returns true if this error originated in plugin code.
    pub fn is_plugin_fault(&self) -> bool {
        matches!(
            self,
            Self::InitFailed { .. }
                | Self::CollectFailed { .. }
                | Self::FlushFailed { .. }
                | Self::PanicContained { .. }
        )
    }

    /// Returns true if the host may retry the call that produced this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CollectFailed { .. } | Self::FlushFailed { .. } | Self::ShutdownTimeout { .. }
        )
    }
}

/// Render a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::plugin_not_found("my-plugin");
        assert_eq!(err.to_string(), "plugin not found: my-plugin");

        let err = Error::init_failed("out", "bad path");
        assert_eq!(err.to_string(), "plugin out initialization failed: bad path");

        let err = Error::panic_contained("out", "collect", "boom");
        assert!(err.to_string().contains("collect"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::DuplicatePlugin("x".into()).is_registration());
        assert!(Error::InvalidPluginName(String::new()).is_registration());
        assert!(!Error::plugin_not_found("x").is_registration());

        assert!(Error::collect_failed("x", "y").is_plugin_fault());
        assert!(Error::panic_contained("x", "init", "y").is_plugin_fault());
        assert!(!Error::config("y").is_plugin_fault());

        assert!(Error::flush_failed("x", "y").is_recoverable());
        assert!(!Error::init_failed("x", "y").is_recoverable());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
