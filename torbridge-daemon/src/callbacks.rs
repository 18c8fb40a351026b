//! Callback bridge: native stream notifications → registry updates + events.
//!
//! Callbacks arrive on threads the native layer owns. Each one validates its
//! token against the table, does at most one remove under the lock, and hands
//! the event to the hub. Destroy (when needed) runs after the lock is released.

use std::sync::Arc;

use torbridge_core::{CallbackSink, CallbackToken, NativeBackend, StreamEvent};

use crate::handles::StreamHandle;
use crate::streams::{Slot, StreamRegistry};

/// Error payload that marks a clean end of stream.
pub const EOF_SIGNAL: &str = "EOF";
/// Substring of the native layer's transport-disconnect errors.
pub const DISCONNECT_MARKER: &str = "NotConnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// Stream ended; destroy it.
    Eof,
    /// Native side already released the stream; forget it without destroy.
    Disconnected,
    /// Informational, leaves the entry alone.
    Other,
}

impl StreamSignal {
    pub fn classify(payload: &str) -> Self {
        if payload == EOF_SIGNAL {
            StreamSignal::Eof
        } else if payload.contains(DISCONNECT_MARKER) {
            StreamSignal::Disconnected
        } else {
            StreamSignal::Other
        }
    }
}

impl<B: NativeBackend> StreamRegistry<B> {
    fn is_live(&self, token: &CallbackToken) -> bool {
        matches!(
            self.lock().slots.get(&token.stream_id),
            Some(Slot::Open(entry)) if entry.generation == token.generation
        )
    }

    /// Remove the entry `token` refers to, if it is still the live one.
    fn take_live(&self, token: &CallbackToken) -> Option<Arc<StreamHandle<B>>> {
        let mut table = self.lock();
        let matches_token = matches!(
            table.slots.get(&token.stream_id),
            Some(Slot::Open(entry)) if entry.generation == token.generation
        );
        if !matches_token {
            return None;
        }
        match table.slots.remove(&token.stream_id) {
            Some(Slot::Open(entry)) => Some(entry.handle),
            _ => None,
        }
    }
}

impl<B: NativeBackend> CallbackSink for StreamRegistry<B> {
    fn on_data(&self, token: &CallbackToken, payload: String) {
        if !self.is_live(token) {
            tracing::debug!(stream_id = %token.stream_id, "data for removed stream dropped");
            return;
        }
        self.events
            .emit(StreamEvent::data(token.stream_id.clone(), payload));
    }

    fn on_error(&self, token: &CallbackToken, payload: String) {
        let signal = StreamSignal::classify(&payload);
        match signal {
            StreamSignal::Eof => {
                let Some(handle) = self.take_live(token) else {
                    tracing::debug!(stream_id = %token.stream_id, "EOF but stream already removed");
                    return;
                };
                drop(handle);
                tracing::info!(stream_id = %token.stream_id, "stream reached EOF");
            }
            StreamSignal::Disconnected => {
                let Some(handle) = self.take_live(token) else {
                    tracing::debug!(stream_id = %token.stream_id, "disconnect but stream already removed");
                    return;
                };
                handle.abandon();
                drop(handle);
                tracing::info!(stream_id = %token.stream_id, error = %payload, "stream disconnected");
            }
            StreamSignal::Other => {
                tracing::debug!(stream_id = %token.stream_id, error = %payload, "stream error event");
            }
        }
        self.events
            .emit(StreamEvent::error(token.stream_id.clone(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_native_error_payloads() {
        assert_eq!(StreamSignal::classify("EOF"), StreamSignal::Eof);
        assert_eq!(
            StreamSignal::classify("Io(NotConnected, \"socket closed\")"),
            StreamSignal::Disconnected
        );
        assert_eq!(StreamSignal::classify("eof"), StreamSignal::Other);
        assert_eq!(StreamSignal::classify("timed out"), StreamSignal::Other);
    }
}
