//! Client event bus
//!
//! Lifecycle transitions (first connect, connect, disconnect), errors and
//! unhandled server messages are broadcast on an [`EventBus`]. Subscribe with
//! [`crate::RtiClient::events`]:
//!
//! ```rust,ignore
//! let mut events = client.events();
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::Error { scope, message } = event {
//!         eprintln!("{}: {}", scope, message);
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::ClientEvent;
