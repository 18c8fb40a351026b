pub mod check;
pub mod request;
pub mod stream;

use std::sync::Arc;

use torbridge_core::BridgeConfig;
use torbridge_daemon::{SystemTorBackend, TorBridge};

pub fn system_bridge(config: BridgeConfig) -> TorBridge<SystemTorBackend> {
    let backend = Arc::new(SystemTorBackend::new(config.tor_binary.clone()));
    TorBridge::new(config, backend)
}
