//! In-process event buses backed by `tokio::sync::broadcast` channels.
//!
//! [`EventBus`] fans incoming [`EventEnvelope`]s out to pipeline workers;
//! [`CallbackBus`] carries outbound [`CallbackEvent`]s for external
//! status reporting. Both are designed to be shared via `Arc`.

use tokio::sync::broadcast;

use crate::event::{CallbackEvent, EventEnvelope};

/// Default buffer capacity for the broadcast channels.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for incoming domain events.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: EventEnvelope) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// In-process fan-out bus for outbound status callbacks.
pub struct CallbackBus {
    sender: broadcast::Sender<CallbackEvent>,
}

impl CallbackBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: CallbackEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallbackEvent> {
        self.sender.subscribe()
    }
}

impl Default for CallbackBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
