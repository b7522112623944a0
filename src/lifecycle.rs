//! Plugin instance lifecycle states and event hooks.

use std::time::Instant;

/// Plugin instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Registry entry resolved, no init yet.
    Created,
    /// Plugin `init` is running.
    Initializing,
    /// Initialized and accepting deliveries.
    Running,
    /// Shutdown requested; buffered records are being drained.
    Draining,
    /// Plugin code has returned; no more deliveries.
    Stopped,
    /// Resources released.
    Terminated,
    /// `init` failed; the host must not call into this instance again.
    Failed,
}

impl LifecycleState {
    /// Check if the instance can be initialized.
    pub fn can_init(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check if records can be delivered or collected.
    pub fn can_deliver(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if the instance can be shut down.
    pub fn can_shutdown(&self) -> bool {
        matches!(self, Self::Created | Self::Running | Self::Failed)
    }

    /// Check if the instance is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Created => "Plugin instance created but not initialized",
            Self::Initializing => "Plugin init running",
            Self::Running => "Plugin running and accepting records",
            Self::Draining => "Plugin shutting down, draining buffered records",
            Self::Stopped => "Plugin stopped",
            Self::Terminated => "Plugin instance released",
            Self::Failed => "Plugin init failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle event for hooks.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Plugin `init` succeeded.
    Initialized {
        /// Plugin name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Plugin `init` failed or panicked.
    InitFailed {
        /// Plugin name.
        name: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
    /// A batch was delivered to an output plugin or collected from an input.
    BatchDelivered {
        /// Plugin name.
        name: String,
        /// Records in the batch.
        records: usize,
        /// Event time.
        at: Instant,
    },
    /// The instance context was cancelled.
    Cancelled {
        /// Plugin name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Plugin code has returned after cancellation.
    Stopped {
        /// Plugin name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Plugin call failed.
    Error {
        /// Plugin name.
        name: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
    /// Instance released.
    Terminated {
        /// Plugin name.
        name: String,
        /// Event time.
        at: Instant,
    },
}

impl LifecycleEvent {
    /// Get the plugin name.
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Initialized { name, .. }
            | Self::InitFailed { name, .. }
            | Self::BatchDelivered { name, .. }
            | Self::Cancelled { name, .. }
            | Self::Stopped { name, .. }
            | Self::Error { name, .. }
            | Self::Terminated { name, .. } => name,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Initialized { at, .. }
            | Self::InitFailed { at, .. }
            | Self::BatchDelivered { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Stopped { at, .. }
            | Self::Error { at, .. }
            | Self::Terminated { at, .. } => *at,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => "initialized",
            Self::InitFailed { .. } => "init_failed",
            Self::BatchDelivered { .. } => "batch_delivered",
            Self::Cancelled { .. } => "cancelled",
            Self::Stopped { .. } => "stopped",
            Self::Error { .. } => "error",
            Self::Terminated { .. } => "terminated",
        }
    }
}

/// Hooks for lifecycle events.
pub struct LifecycleHooks {
    handlers: Vec<Box<dyn Fn(&LifecycleEvent) + Send + Sync>>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: LifecycleEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    /// Emit an initialized event.
    pub fn emit_initialized(&self, name: &str) {
        self.emit(LifecycleEvent::Initialized {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an init failed event.
    pub fn emit_init_failed(&self, name: &str, message: &str) {
        self.emit(LifecycleEvent::InitFailed {
            name: name.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a batch delivered event.
    pub fn emit_batch_delivered(&self, name: &str, records: usize) {
        self.emit(LifecycleEvent::BatchDelivered {
            name: name.to_string(),
            records,
            at: Instant::now(),
        });
    }

    /// Emit a cancelled event.
    pub fn emit_cancelled(&self, name: &str) {
        self.emit(LifecycleEvent::Cancelled {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a stopped event.
    pub fn emit_stopped(&self, name: &str) {
        self.emit(LifecycleEvent::Stopped {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an error event.
    pub fn emit_error(&self, name: &str, message: &str) {
        self.emit(LifecycleEvent::Error {
            name: name.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a terminated event.
    pub fn emit_terminated(&self, name: &str) {
        self.emit(LifecycleEvent::Terminated {
            name: name.to_string(),
            at: Instant::now(),
        });
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}
