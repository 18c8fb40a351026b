//! Async bridge between a host application and an embedded tor daemon:
//! lifecycle, proxied HTTP requests, and raw TCP streams with event fan-out.

mod bridge;
mod callbacks;
mod events;
mod handles;
mod lifecycle;
pub mod logging;
pub mod request;
mod streams;
pub mod system_tor;

#[cfg(feature = "sifir")]
pub mod sifir;

pub use bridge::TorBridge;
pub use callbacks::{StreamSignal, DISCONNECT_MARKER, EOF_SIGNAL};
pub use events::{EventHub, EVENT_CAPACITY};
pub use lifecycle::ProxyEndpoint;
pub use logging::{init_tracing, LogFormat};
pub use request::{ProxiedRequest, RequestResult};
pub use system_tor::SystemTorBackend;
