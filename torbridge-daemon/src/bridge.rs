//! Host-facing facade: the one process-scoped object hosts talk to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use torbridge_core::{
    BridgeConfig, BridgeError, DaemonPhase, NativeBackend, StreamEvent, StreamId, StreamInfo,
};

use crate::events::EventHub;
use crate::lifecycle::Lifecycle;
use crate::request::{self, ProxiedRequest, RequestResult};
use crate::streams::StreamRegistry;

/// Daemon, streams and event fan-out for one native backend.
///
/// Create one per process and share it by reference (or `Arc`). Dropping it
/// releases every stream and then the daemon.
pub struct TorBridge<B: NativeBackend> {
    config: BridgeConfig,
    // Field order is drop order: streams go before the daemon.
    streams: Arc<StreamRegistry<B>>,
    lifecycle: Lifecycle<B>,
    events: EventHub,
}

impl<B: NativeBackend> TorBridge<B> {
    pub fn new(config: BridgeConfig, backend: Arc<B>) -> Self {
        let events = EventHub::default();
        let streams = StreamRegistry::new(backend.clone(), events.clone());
        let lifecycle = Lifecycle::new(backend, config.work_dir.clone(), config.socks_port);
        Self {
            config,
            streams,
            lifecycle,
            events,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn phase(&self) -> DaemonPhase {
        self.lifecycle.phase()
    }

    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.started_at()
    }

    /// Start the daemon; resolves with the SOCKS port once bootstrapped.
    pub async fn start_daemon(
        &self,
        startup_timeout: Duration,
        client_timeout: Duration,
    ) -> Result<u16, BridgeError> {
        self.lifecycle.start(startup_timeout, client_timeout).await
    }

    /// Start with the configured timeouts.
    pub async fn start_daemon_default(&self) -> Result<u16, BridgeError> {
        self.start_daemon(self.config.startup_timeout(), self.config.client_timeout())
            .await
    }

    /// `NOTINIT`, `STARTING`, or the native daemon's own status string.
    pub async fn daemon_status(&self) -> Result<String, BridgeError> {
        self.lifecycle.live_status().await
    }

    /// Stop the daemon. Never fails: a stop that races a start waits for the
    /// start to settle and then tears down whatever it produced. A stop that
    /// races another stop returns once the daemon is released.
    pub async fn stop_daemon(&self) {
        loop {
            match self.lifecycle.stop(&self.streams).await {
                Err(BridgeError::Busy) => {
                    tracing::debug!("stop waiting for in-flight transition to settle");
                    self.lifecycle.wait_settled().await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "daemon stop reported an error");
                    return;
                }
                Ok(()) => return,
            }
        }
    }

    pub async fn request(&self, request: ProxiedRequest) -> Result<RequestResult, BridgeError> {
        let endpoint = self.lifecycle.endpoint()?;
        request::execute(endpoint.port, endpoint.client_timeout, &request).await
    }

    /// Open a tunnel to `target` (`host:port`). `id` is generated when absent.
    pub async fn start_tcp_stream(
        &self,
        id: Option<StreamId>,
        target: &str,
        timeout: Duration,
    ) -> Result<StreamId, BridgeError> {
        let lifecycle = &self.lifecycle;
        self.streams
            .open(id, target, timeout, || {
                lifecycle.endpoint().map(|endpoint| endpoint.socket_addr())
            })
            .await
    }

    pub async fn send_tcp_stream_message(
        &self,
        id: &StreamId,
        message: &str,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        self.lifecycle.endpoint()?;
        self.streams.send(id, message, timeout).await
    }

    pub async fn stop_tcp_stream(&self, id: &StreamId) -> Result<(), BridgeError> {
        self.streams.close(id).await
    }

    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.streams.list()
    }

    /// Attach a subscriber. Events are only produced while one is attached.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.events.has_subscribers()
    }
}
