//! Subscriber-facing event channel.

use tokio::sync::broadcast;

use torbridge_core::StreamEvent;

/// Per-subscriber backlog before the slowest receiver starts lagging.
pub const EVENT_CAPACITY: usize = 256;

/// Fan-out of stream events to every attached subscriber.
///
/// Emission is synchronous and lock-free from the caller's side, so native
/// callback threads can hand events off without blocking. One sender keeps a
/// stream's events in the order its callbacks fired.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    /// Deliver `event`, or drop it when nobody is listening.
    pub fn emit(&self, event: StreamEvent) {
        if !self.has_subscribers() {
            tracing::trace!(stream_id = %event.stream_id, "no subscribers; event dropped");
            return;
        }
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}
