//! Owning wrappers around native resources.
//!
//! A wrapper is the only thing that can release its resource, and it does so
//! exactly once, in `Drop` or through an explicit `release`. Sharing goes through `Arc`, so an in-flight send
//! keeps its stream alive and the release happens when the last user is done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use torbridge_core::{NativeBackend, NativeError, StreamObserver};

/// The running daemon. Dropping it shuts the daemon down.
///
/// Status queries and the release share one lock, so a query that is still
/// running holds the shutdown off until it returns.
pub(crate) struct DaemonHandle<B: NativeBackend> {
    backend: Arc<B>,
    service: Mutex<Option<B::Service>>,
}

impl<B: NativeBackend> DaemonHandle<B> {
    pub(crate) fn new(backend: Arc<B>, service: B::Service) -> Self {
        Self {
            backend,
            service: Mutex::new(Some(service)),
        }
    }

    pub(crate) fn status(&self) -> Result<String, NativeError> {
        match &*self.lock() {
            Some(service) => self.backend.service_status(service),
            None => Err(NativeError::new("daemon handle already released")),
        }
    }

    /// Shut the daemon down now, even if other clones of the handle exist.
    pub(crate) fn release(&self) {
        let taken = self.lock().take();
        if let Some(service) = taken {
            tracing::debug!("releasing native daemon handle");
            self.backend.shutdown_service(service);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<B::Service>> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: NativeBackend> Drop for DaemonHandle<B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// One native tunnel. Dropping it destroys the tunnel unless it was abandoned.
pub(crate) struct StreamHandle<B: NativeBackend> {
    backend: Arc<B>,
    stream: Option<B::Stream>,
    abandoned: AtomicBool,
}

impl<B: NativeBackend> StreamHandle<B> {
    pub(crate) fn new(backend: Arc<B>, stream: B::Stream) -> Self {
        Self {
            backend,
            stream: Some(stream),
            abandoned: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe(&self, observer: StreamObserver) {
        if let Some(stream) = &self.stream {
            self.backend.subscribe_stream(stream, observer);
        }
    }

    pub(crate) fn send(&self, message: &str, timeout: Duration) -> Result<(), NativeError> {
        match &self.stream {
            Some(stream) => self.backend.send_stream(stream, message, timeout),
            None => Err(NativeError::new("stream already released")),
        }
    }

    /// The native side already tore this stream down; never call destroy on it.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }
}

impl<B: NativeBackend> Drop for StreamHandle<B> {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if self.abandoned.load(Ordering::SeqCst) {
            tracing::debug!("dropping abandoned stream without native destroy");
            return;
        }
        self.backend.destroy_stream(stream);
    }
}
