//! Error types for torbridge.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::StreamId;

/// Every failure a bridge operation can surface to the host.
///
/// Nothing here is fatal to the host process: the worst outcome is a stream or
/// daemon left unusable until an explicit stop/retry.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// `start` while a start is in flight or the daemon is already up.
    #[error("tor service already running; call stop first")]
    AlreadyRunning,

    #[error("tor service not running; call start first")]
    NotRunning,

    /// A start or stop is already in flight. Retry once it settles.
    #[error("tor service is changing state; retry when it settles")]
    Busy,

    #[error("daemon start failed: {0}")]
    StartError(String),

    /// The native status query failed while the daemon was running.
    #[error("daemon status unknown")]
    StatusUnknown,

    #[error("stream {0} already open")]
    DuplicateStream(StreamId),

    #[error("stream {0} not found")]
    NotFound(StreamId),

    #[error("stream open failed: {0}")]
    StreamOpenError(String),

    #[error("stream send failed: {0}")]
    SendError(String),

    /// Non-2xx response; carries the raw body text.
    #[error("request failed with status {status}: {body}")]
    RequestError { status: u16, body: String },

    #[error("could not parse url '{0}'")]
    UrlParseError(String),

    #[error("unsupported request method '{0}'")]
    UnsupportedMethod(String),

    /// Transport failure before any response arrived.
    #[error("network error: {0}")]
    Network(String),

    #[error("could not build proxied client: {0}")]
    ClientBuild(String),

    /// An octet-stream body that is not valid base64.
    #[error("request body is not valid base64: {0}")]
    BodyDecode(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl BridgeError {
    /// Host-facing rejection domain, matching what the mobile bridges report.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::AlreadyRunning | BridgeError::Busy | BridgeError::StartError(_) => {
                "TOR.START"
            }
            BridgeError::NotRunning => "TOR.SERVICE",
            BridgeError::StatusUnknown => "TOR.STATUS",
            BridgeError::DuplicateStream(_)
            | BridgeError::NotFound(_)
            | BridgeError::StreamOpenError(_)
            | BridgeError::SendError(_) => "TOR.TCPCONN",
            BridgeError::RequestError { .. }
            | BridgeError::ClientBuild(_)
            | BridgeError::BodyDecode(_) => "TOR.REQUEST",
            BridgeError::UrlParseError(_) => "TOR.URL",
            BridgeError::UnsupportedMethod(_) => "TOR.REQUEST_METHOD",
            BridgeError::Network(_) => "TOR.NETWORK",
            BridgeError::Io { .. } | BridgeError::Config { .. } | BridgeError::ChannelClosed(_) => {
                "TOR"
            }
        }
    }

    /// `true` when the same call may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Busy | BridgeError::Network(_))
    }
}

/// Convenience constructor for [`BridgeError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> BridgeError {
    BridgeError::Io {
        path: path.into(),
        source,
    }
}
