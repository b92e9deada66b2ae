//! Client lifecycle and delivery events

use serde::{Deserialize, Serialize};

/// Observable client activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// First successful authentication of this client instance
    FirstConnect,
    /// Authenticated, including after every reconnect
    Connect,
    /// Socket dropped or closed
    Disconnect,
    /// Failure surfaced from the transport, a handler or the broker
    Error { scope: String, message: String },
    /// Named server event with no dedicated listener
    Message { channel: String, payload: String },
}

impl ClientEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::FirstConnect => "FirstConnect",
            ClientEvent::Connect => "Connect",
            ClientEvent::Disconnect => "Disconnect",
            ClientEvent::Error { .. } => "Error",
            ClientEvent::Message { .. } => "Message",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ClientEvent::Error { .. })
    }
}
