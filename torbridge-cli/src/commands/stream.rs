//! `torbridge stream`: open a tunnel, send, print events.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use torbridge_core::{BridgeConfig, BridgeError, StreamEventKind, StreamId};
use torbridge_daemon::{StreamSignal, SystemTorBackend, TorBridge};

use super::system_bridge;

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Target as host:port.
    pub target: String,

    /// Caller-chosen stream id (a UUID is generated otherwise).
    #[arg(long)]
    pub id: Option<String>,

    /// Message to send once connected. Repeatable; sent in order.
    #[arg(long = "send")]
    pub messages: Vec<String>,

    /// Stop listening after this many seconds.
    #[arg(long, default_value_t = 10)]
    pub wait_secs: u64,

    /// Connect/send timeout in seconds.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

impl StreamArgs {
    pub async fn run(self, config: BridgeConfig) -> Result<()> {
        let bridge = system_bridge(config);
        let outcome = self.session(&bridge).await;
        bridge.stop_daemon().await;
        outcome
    }

    async fn session(&self, bridge: &TorBridge<SystemTorBackend>) -> Result<()> {
        bridge
            .start_daemon_default()
            .await
            .context("tor did not start")?;

        let timeout = Duration::from_secs(self.timeout_secs);
        let mut events = bridge.subscribe();
        let id = bridge
            .start_tcp_stream(self.id.clone().map(StreamId::from), &self.target, timeout)
            .await
            .with_context(|| format!("failed to open stream to {}", self.target))?;
        eprintln!("{} {} -> {}", "stream".green().bold(), id, self.target);

        for message in &self.messages {
            bridge
                .send_tcp_stream_message(&id, message, timeout)
                .await
                .with_context(|| format!("failed to send on stream {id}"))?;
        }

        let deadline = Instant::now() + Duration::from_secs(self.wait_secs);
        let ended = loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => break false,
                Ok(Ok(event)) => event,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                    continue;
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(BridgeError::ChannelClosed("stream events").into())
                }
            };
            if event.stream_id != id {
                continue;
            }
            println!("{} {}", event.event_name(), event.host_body());
            if event.kind == StreamEventKind::Error
                && StreamSignal::classify(&event.payload) != StreamSignal::Other
            {
                break true;
            }
        };

        if !ended {
            match bridge.stop_tcp_stream(&id).await {
                Ok(()) | Err(BridgeError::NotFound(_)) => {}
                Err(err) => return Err(err).context("failed to close stream"),
            }
        }
        Ok(())
    }
}
