//! torbridge core library: domain types, foreign-interface traits, config, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes, daemon phases, stream events
//! - [`native`]: the opaque-handle seam to the external daemon
//! - [`config`]: [`BridgeConfig`] load / defaults
//! - [`error`]: [`BridgeError`]

pub mod config;
pub mod error;
pub mod native;
pub mod types;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use native::{CallbackSink, CallbackToken, NativeBackend, NativeError, StreamObserver};
pub use types::{DaemonPhase, HttpMethod, StreamEvent, StreamEventKind, StreamId, StreamInfo};
