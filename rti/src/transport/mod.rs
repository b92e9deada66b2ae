//! Transport layer: framing, correlation and socket I/O
//!
//! - [`envelope`] - JSON envelope and inbound frame classification
//! - [`session`] - handshake, token lifecycle, subscriptions and RPC correlation
//! - [`scheduler`] - owned or caller-driven I/O loop with reconnection

pub mod envelope;
pub mod scheduler;
pub mod session;

pub use envelope::{Envelope, Inbound};
pub use scheduler::{SchedulingStrategy, drive_external, spawn_owned};
pub use session::{
    AckHandler, ChannelListener, EventListener, SessionObserver, SessionState, TransportOptions, TransportSession,
};
