//! # flb-bridge
//!
//! Write Fluent Bit input and output plugins in Rust.
//!
//! This crate provides:
//! - **Registration** - Name a plugin implementation once at process start
//! - **Decoding** - Turn the host's MessagePack buffers into [`Record`]s
//! - **Delivery** - Ordered, bounded channels between host and plugin threads
//! - **Cancellation** - A [`Context`] that carries host shutdown into plugin code
//! - **Lifecycle Management** - Init, collect, drain and exit with bounded waits
//! - **C ABI** - `extern "C"` entry points in [`ffi`] for the host
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flb_bridge::{register_output, ConfigLoader, Context, OutputPlugin, PluginResult, RecordReceiver};
//!
//! struct Stdout;
//!
//! impl OutputPlugin for Stdout {
//!     fn init(&self, _ctx: &Context, _config: &dyn ConfigLoader) -> PluginResult {
//!         Ok(())
//!     }
//!
//!     fn collect(&self, _ctx: &Context, tag: &str, records: RecordReceiver) -> PluginResult {
//!         for record in records {
//!             println!("{} {}", tag, record.fields_display());
//!         }
//!         Ok(())
//!     }
//! }
//!
//! register_output("rust-stdout", "prints records", Stdout)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): JSON rendering of records and TOML configuration
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod bridge;
mod channel;
mod codec;
mod config;
mod context;
mod error;
mod instance;
mod lifecycle;
mod plugin;
mod record;
mod registry;

pub mod ffi;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use bridge::{Bridge, Status};
pub use channel::{channel, ChannelStats, Received, RecordReceiver, RecordSender, SendError};
pub use codec::{
    decode_batch, encode_record, DecodeError, DecodedBatch, Decoder, Encoder, EVENT_TIME_EXT,
};
pub use config::{BridgeConfig, ConfigLoader, ConfigMap};
pub use context::{CancelReason, Context};
pub use error::{BoxError, Error, PluginResult, Result};
pub use instance::{DeliveryReport, InputBatch, PluginInstance, ShutdownReport};
pub use lifecycle::{LifecycleEvent, LifecycleHooks, LifecycleState};
pub use plugin::{InputPlugin, OutputPlugin, PluginDescriptor, PluginImpl, PluginKind};
pub use record::{FieldsDisplay, Record, Value};
pub use registry::{global, register_input, register_output, PluginRegistry, RegistryConfig};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{BridgeMetrics, MetricsConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
