//! Event Bus - broadcast of client lifecycle events
//!
//! The EventBus uses a tokio broadcast channel so any number of observers
//! (application code, tests, loggers) can follow connects, disconnects and
//! errors without registering callbacks on the client.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::ClientEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Fan-out of [`ClientEvent`]s to all subscribers
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped, and a lagging
    /// subscriber loses the oldest events.
    pub fn emit(&self, event: ClientEvent) {
        debug!(event_type = event.event_type(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    // === Convenience methods ===

    pub fn error(&self, scope: &str, message: impl Into<String>) {
        self.emit(ClientEvent::Error {
            scope: scope.to_string(),
            message: message.into(),
        });
    }

    pub fn message(&self, channel: &str, payload: impl Into<String>) {
        self.emit(ClientEvent::Message {
            channel: channel.to_string(),
            payload: payload.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
