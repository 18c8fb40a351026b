//! Domain types shared by the bridge and its hosts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of one TCP tunnel, unique among live streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    /// A fresh random identifier (UUIDv4, uppercase like the mobile hosts use).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Coarse lifecycle phase of the process-wide daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DaemonPhase {
    #[default]
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl DaemonPhase {
    /// Status string for phases that need no native query.
    ///
    /// A stopped daemon holds no handle, so hosts see it as `NOTINIT` again.
    pub fn host_str(&self) -> &'static str {
        match self {
            DaemonPhase::Uninitialized | DaemonPhase::Stopped => "NOTINIT",
            DaemonPhase::Starting => "STARTING",
            DaemonPhase::Running => "RUNNING",
            DaemonPhase::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for DaemonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonPhase::Uninitialized => write!(f, "uninitialized"),
            DaemonPhase::Starting => write!(f, "starting"),
            DaemonPhase::Running => write!(f, "running"),
            DaemonPhase::Stopping => write!(f, "stopping"),
            DaemonPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Methods the proxied request executor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl FromStr for HttpMethod {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(HttpMethod::Get),
            "post" => Ok(HttpMethod::Post),
            "delete" => Ok(HttpMethod::Delete),
            _ => Err(BridgeError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Data,
    Error,
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One notification for subscribers, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub kind: StreamEventKind,
    pub payload: String,
}

impl StreamEvent {
    pub fn data(stream_id: StreamId, payload: impl Into<String>) -> Self {
        Self {
            stream_id,
            kind: StreamEventKind::Data,
            payload: payload.into(),
        }
    }

    pub fn error(stream_id: StreamId, payload: impl Into<String>) -> Self {
        Self {
            stream_id,
            kind: StreamEventKind::Error,
            payload: payload.into(),
        }
    }

    /// Event name on the host's emitter.
    pub fn event_name(&self) -> &'static str {
        match self.kind {
            StreamEventKind::Data => "torTcpStreamData",
            StreamEventKind::Error => "torTcpStreamError",
        }
    }

    /// `<id>||<payload>`, the body format host listeners split on.
    pub fn host_body(&self) -> String {
        format!("{}||{}", self.stream_id, self.payload)
    }
}

/// Read-only view of a live registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub target: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_fresh() {
        let a = StreamId::generate();
        let b = StreamId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn phase_host_strings() {
        assert_eq!(DaemonPhase::Uninitialized.host_str(), "NOTINIT");
        assert_eq!(DaemonPhase::Stopped.host_str(), "NOTINIT");
        assert_eq!(DaemonPhase::Starting.host_str(), "STARTING");
        assert_eq!(DaemonPhase::Stopping.host_str(), "STOPPING");
    }

    #[test]
    fn event_host_body_joins_id_and_payload() {
        let event = StreamEvent::error(StreamId::from("abc"), "EOF");
        assert_eq!(event.event_name(), "torTcpStreamError");
        assert_eq!(event.host_body(), "abc||EOF");
    }
}
