//! The seam to the external daemon.
//!
//! The daemon and its SOCKS stream implementation live outside this workspace
//! and are reached only through opaque handles. [`NativeBackend`] names the
//! capabilities the bridge needs; implementations decide whether those are a
//! C library, a child process, or a test double.
//!
//! # Ownership
//!
//! `Service` and `Stream` values are produced only by `start_service` /
//! `open_stream` and consumed only by `shutdown_service` / `destroy_stream`.
//! Neither is `Clone`. Dropping a `Stream` without destroying it must leave the
//! native resource alone: that is how the bridge abandons a stream the native
//! side has already torn down.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Weak;
use std::time::Duration;

use crate::types::StreamId;

const UNKNOWN_NATIVE_ERROR: &str = "unknown error";

/// Failure reported by the native layer, which may or may not say why.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeError {
    message: Option<String>,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// A failure with no payload.
    pub fn unknown() -> Self {
        Self { message: None }
    }

    /// Empty payloads count as absent.
    pub fn from_optional(message: Option<String>) -> Self {
        Self {
            message: message.filter(|m| !m.trim().is_empty()),
        }
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(UNKNOWN_NATIVE_ERROR)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for NativeError {}

/// Context token handed to the native layer with each stream's callbacks.
///
/// The generation makes tokens unique even when a caller reuses a stream id
/// after closing it, so a late callback for the old stream cannot touch the new
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackToken {
    pub stream_id: StreamId,
    pub generation: u64,
}

/// Receiver of raw native callbacks. Implementations must tolerate being
/// called from any thread, concurrently, after the stream is gone.
pub trait CallbackSink: Send + Sync {
    fn on_data(&self, token: &CallbackToken, payload: String);
    fn on_error(&self, token: &CallbackToken, payload: String);
}

/// The pair of callback entry points registered for one stream.
///
/// Holds the sink weakly: streams are owned by the sink's registry, so a strong
/// reference here would keep the registry alive through its own handles.
#[derive(Clone)]
pub struct StreamObserver {
    token: CallbackToken,
    sink: Weak<dyn CallbackSink>,
}

impl StreamObserver {
    pub fn new(token: CallbackToken, sink: Weak<dyn CallbackSink>) -> Self {
        Self { token, sink }
    }

    pub fn token(&self) -> &CallbackToken {
        &self.token
    }

    pub fn on_data(&self, payload: String) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_data(&self.token, payload);
        }
    }

    pub fn on_error(&self, payload: String) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_error(&self.token, payload);
        }
    }
}

impl fmt::Debug for StreamObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamObserver")
            .field("token", &self.token)
            .field("attached", &(self.sink.strong_count() > 0))
            .finish()
    }
}

/// Capabilities of the external daemon. Every method may block.
pub trait NativeBackend: Send + Sync + 'static {
    /// Opaque running-daemon resource.
    type Service: Send + Sync + 'static;
    /// Opaque TCP tunnel resource.
    type Stream: Send + Sync + 'static;

    /// Start the daemon with its working state under `work_dir` and a SOCKS
    /// listener on `socks_port`, blocking until it is usable or `timeout`.
    fn start_service(
        &self,
        work_dir: &Path,
        socks_port: u16,
        timeout: Duration,
    ) -> Result<Self::Service, NativeError>;

    /// Live sub-status string of a running daemon.
    fn service_status(&self, service: &Self::Service) -> Result<String, NativeError>;

    fn shutdown_service(&self, service: Self::Service);

    /// Open a tunnel to `target` (`host:port`) through the proxy at `proxy`.
    fn open_stream(
        &self,
        target: &str,
        proxy: SocketAddr,
        timeout: Duration,
    ) -> Result<Self::Stream, NativeError>;

    /// Register the callback pair. Called at most once per stream.
    fn subscribe_stream(&self, stream: &Self::Stream, observer: StreamObserver);

    fn send_stream(
        &self,
        stream: &Self::Stream,
        message: &str,
        timeout: Duration,
    ) -> Result<(), NativeError>;

    /// Release the stream. No callbacks may arrive once this returns.
    fn destroy_stream(&self, stream: Self::Stream);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl CallbackSink for Recorder {
        fn on_data(&self, token: &CallbackToken, payload: String) {
            self.seen
                .lock()
                .unwrap()
                .push((token.stream_id.to_string(), payload));
        }

        fn on_error(&self, token: &CallbackToken, payload: String) {
            self.seen
                .lock()
                .unwrap()
                .push((token.stream_id.to_string(), format!("err:{payload}")));
        }
    }

    fn token() -> CallbackToken {
        CallbackToken {
            stream_id: StreamId::from("s1"),
            generation: 1,
        }
    }

    #[test]
    fn native_error_falls_back_to_placeholder() {
        assert_eq!(NativeError::unknown().message(), "unknown error");
        assert_eq!(
            NativeError::from_optional(Some("  ".into())).message(),
            "unknown error"
        );
        assert_eq!(NativeError::new("boom").to_string(), "boom");
    }

    #[test]
    fn observer_forwards_while_sink_alive() {
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn CallbackSink> = recorder.clone();
        let observer = StreamObserver::new(token(), Arc::downgrade(&sink));

        observer.on_data("hi".into());
        observer.on_error("EOF".into());

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("s1".to_string(), "hi".to_string()),
                ("s1".to_string(), "err:EOF".to_string()),
            ]
        );
    }

    #[test]
    fn observer_is_silent_after_sink_dropped() {
        let sink: Arc<dyn CallbackSink> = Arc::new(Recorder::default());
        let observer = StreamObserver::new(token(), Arc::downgrade(&sink));
        drop(sink);

        // Must not panic or deliver anywhere.
        observer.on_data("late".into());
        assert!(format!("{observer:?}").contains("attached: false"));
    }
}
