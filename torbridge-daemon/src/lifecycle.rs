//! Daemon lifecycle controller.
//!
//! ```text
//! Uninitialized ──start──▶ Starting ──ok──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!       ▲                     │                                                │
//!       └──── fail/timeout ───┘◀────────────────── start ──────────────────────┘
//! ```
//!
//! The state lives behind one mutex that is only held for the transition
//! itself. The native start and shutdown run on the blocking pool with the
//! lock released; `Starting` and `Stopping` keep other callers out meanwhile.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use torbridge_core::{BridgeError, DaemonPhase, NativeBackend, NativeError};

use crate::handles::DaemonHandle;
use crate::streams::StreamRegistry;

struct RunningDaemon<B: NativeBackend> {
    handle: Arc<DaemonHandle<B>>,
    proxy_port: u16,
    client_timeout: Duration,
    started_at: DateTime<Utc>,
}

enum DaemonState<B: NativeBackend> {
    Uninitialized,
    Starting,
    Running(RunningDaemon<B>),
    Stopping,
    Stopped,
}

impl<B: NativeBackend> DaemonState<B> {
    fn phase(&self) -> DaemonPhase {
        match self {
            DaemonState::Uninitialized => DaemonPhase::Uninitialized,
            DaemonState::Starting => DaemonPhase::Starting,
            DaemonState::Running(_) => DaemonPhase::Running,
            DaemonState::Stopping => DaemonPhase::Stopping,
            DaemonState::Stopped => DaemonPhase::Stopped,
        }
    }
}

/// Address and timeout requests/streams need from a running daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub port: u16,
    pub client_timeout: Duration,
}

impl ProxyEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

pub struct Lifecycle<B: NativeBackend> {
    backend: Arc<B>,
    work_dir: PathBuf,
    socks_port: u16,
    state: Mutex<DaemonState<B>>,
    settled: Notify,
}

impl<B: NativeBackend> Lifecycle<B> {
    pub fn new(backend: Arc<B>, work_dir: PathBuf, socks_port: u16) -> Self {
        Self {
            backend,
            work_dir,
            socks_port,
            state: Mutex::new(DaemonState::Uninitialized),
            settled: Notify::new(),
        }
    }

    pub fn phase(&self) -> DaemonPhase {
        self.lock().phase()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &*self.lock() {
            DaemonState::Running(running) => Some(running.started_at),
            _ => None,
        }
    }

    /// Start the daemon and return its SOCKS port.
    pub async fn start(
        &self,
        startup_timeout: Duration,
        client_timeout: Duration,
    ) -> Result<u16, BridgeError> {
        {
            let mut state = self.lock();
            match *state {
                DaemonState::Starting | DaemonState::Running(_) => {
                    return Err(BridgeError::AlreadyRunning)
                }
                // The old daemon may still hold the port.
                DaemonState::Stopping => return Err(BridgeError::Busy),
                DaemonState::Uninitialized | DaemonState::Stopped => {
                    *state = DaemonState::Starting;
                }
            }
        }
        let mut guard = StartingGuard {
            lifecycle: self,
            armed: true,
        };
        tracing::info!(
            socks_port = self.socks_port,
            timeout_ms = startup_timeout.as_millis() as u64,
            "starting tor daemon",
        );

        let backend = self.backend.clone();
        let work_dir = self.work_dir.clone();
        let socks_port = self.socks_port;
        // The handle is wrapped inside the task so a start that finishes after
        // we gave up on it is shut down instead of leaked.
        let task = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&work_dir).map_err(|err| {
                NativeError::new(format!(
                    "cannot create work dir {}: {err}",
                    work_dir.display()
                ))
            })?;
            backend
                .start_service(&work_dir, socks_port, startup_timeout)
                .map(|service| DaemonHandle::new(backend.clone(), service))
        });

        let outcome = match tokio::time::timeout(startup_timeout, task).await {
            Err(_) => Err(format!(
                "daemon did not start within {}ms",
                startup_timeout.as_millis()
            )),
            Ok(Err(join_err)) => Err(format!("start task join error: {join_err}")),
            Ok(Ok(Err(native))) => Err(native.message().to_string()),
            Ok(Ok(Ok(handle))) => Ok(handle),
        };

        match outcome {
            Ok(handle) => {
                {
                    let mut state = self.lock();
                    *state = DaemonState::Running(RunningDaemon {
                        handle: Arc::new(handle),
                        proxy_port: socks_port,
                        client_timeout,
                        started_at: Utc::now(),
                    });
                }
                guard.armed = false;
                self.settled.notify_waiters();
                tracing::info!(socks_port, "tor daemon running");
                Ok(socks_port)
            }
            Err(message) => {
                drop(guard);
                tracing::warn!(error = %message, "tor daemon failed to start");
                Err(BridgeError::StartError(message))
            }
        }
    }

    /// Live status from the native daemon. Only meaningful while running.
    pub async fn live_status(&self) -> Result<String, BridgeError> {
        let handle = match &*self.lock() {
            DaemonState::Running(running) => running.handle.clone(),
            other => return Ok(other.phase().host_str().to_string()),
        };
        tokio::task::spawn_blocking(move || handle.status())
            .await
            .map_err(|_| BridgeError::StatusUnknown)?
            .map_err(|err| {
                tracing::warn!(error = %err, "native status query failed");
                BridgeError::StatusUnknown
            })
    }

    pub fn endpoint(&self) -> Result<ProxyEndpoint, BridgeError> {
        match &*self.lock() {
            DaemonState::Running(running) => Ok(ProxyEndpoint {
                port: running.proxy_port,
                client_timeout: running.client_timeout,
            }),
            _ => Err(BridgeError::NotRunning),
        }
    }

    /// Tear down every stream, then the daemon.
    ///
    /// No-op without a handle. Fails with `Busy` while a start or another stop
    /// is in flight; [`Lifecycle::wait_settled`] then resolves once it is safe
    /// to retry. The phase only reaches `Stopped` after the native shutdown
    /// has returned.
    pub async fn stop(&self, streams: &StreamRegistry<B>) -> Result<(), BridgeError> {
        let running = {
            let mut state = self.lock();
            match &*state {
                DaemonState::Starting | DaemonState::Stopping => return Err(BridgeError::Busy),
                DaemonState::Uninitialized | DaemonState::Stopped => return Ok(()),
                DaemonState::Running(_) => {}
            }
            match std::mem::replace(&mut *state, DaemonState::Stopping) {
                DaemonState::Running(running) => running,
                _ => return Ok(()),
            }
        };
        let mut stopping = StoppingGuard {
            lifecycle: self,
            handle: Some(running.handle),
        };

        let closed = streams.close_all().await;
        if let Some(handle) = stopping.handle.take() {
            if let Err(err) = tokio::task::spawn_blocking(move || handle.release()).await {
                tracing::warn!(error = %err, "daemon shutdown task failed");
            }
        }
        drop(stopping);
        tracing::info!(closed_streams = closed, "tor daemon stopped");
        Ok(())
    }

    /// Resolve once no start or stop is in flight.
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !matches!(self.phase(), DaemonPhase::Starting | DaemonPhase::Stopping) {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, DaemonState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rolls `Starting` back to `Uninitialized` unless the start committed,
/// including when the `start` future is dropped mid-flight.
struct StartingGuard<'a, B: NativeBackend> {
    lifecycle: &'a Lifecycle<B>,
    armed: bool,
}

impl<B: NativeBackend> Drop for StartingGuard<'_, B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.lifecycle.lock();
            if matches!(*state, DaemonState::Starting) {
                *state = DaemonState::Uninitialized;
            }
        }
        self.lifecycle.settled.notify_waiters();
    }
}

/// Settles `Stopping` into `Stopped`. A `stop` future dropped before it
/// reached the native shutdown releases the daemon here first.
struct StoppingGuard<'a, B: NativeBackend> {
    lifecycle: &'a Lifecycle<B>,
    handle: Option<Arc<DaemonHandle<B>>>,
}

impl<B: NativeBackend> Drop for StoppingGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        {
            let mut state = self.lifecycle.lock();
            if matches!(*state, DaemonState::Stopping) {
                *state = DaemonState::Stopped;
            }
        }
        self.lifecycle.settled.notify_waiters();
    }
}
