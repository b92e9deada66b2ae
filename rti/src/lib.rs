//! RTI - client for a real-time pub/sub coordination bus
//!
//! Simulation and runtime tools use the bus to exchange state, metrics and
//! commands, and to drive each other through a shared lifecycle
//! (load, start, pause, end, stop).
//!
//! # Core Concepts
//!
//! - **One Socket**: pub/sub, RPC and authentication share one websocket session
//! - **Federations**: channel names are namespaced per federation on the wire
//! - **Presence**: clients announce themselves and their channel usage unless incognito
//! - **Measurements**: samples are published immediately or as tumbling-window summaries
//!
//! # Modules
//!
//! - [`transport`] - Websocket session, wire envelopes and scheduling strategies
//! - [`client`] - Channel subscriptions, publishing, presence and commands
//! - [`measure`] - Measurement aggregation
//! - [`control`] - Runtime-control state machine
//! - [`config`] - Configuration types and loading
//! - [`proto`] - Channel payloads

pub mod client;
pub mod config;
pub mod constants;
pub mod control;
pub mod error;
pub mod events;
pub mod measure;
pub mod proto;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientIdentity, CommandHandler, CommandRegistry, CommandRequest, RtiClient, SubscriptionId};
pub use config::ClientConfig;
pub use control::{LoadOutcome, NoHooks, RuntimeControlFsm, RuntimeControlHooks};
pub use error::{RtiError, RtiResult};
pub use events::{ClientEvent, EventBus};
pub use measure::{MeasurementAggregator, MeasurementSink};
pub use proto::RuntimeState;
pub use transport::{SchedulingStrategy, SessionState, TransportOptions, TransportSession};
