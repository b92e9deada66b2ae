//! Application payloads carried over bus channels
//!
//! Binary payloads are protobuf messages, base64-encoded into the text
//! `data` field of a `#publish` envelope.

mod command;
mod control;
mod discovery;
mod metrics;
mod presence;

pub use command::{Command, CommandParameter, CommandResponse, Commands, ExecuteCommand, commands};
pub use control::{
    CurrentLog, LoadScenario, RuntimeControl, RuntimeError, RuntimeState, Seek, SetTimeScale, TimeSync,
    runtime_control,
};
pub use discovery::{Channel, ChannelUsage, ChannelUse, Channels, channels};
pub use metrics::{Measure, Measurement, Measures, measurement, measures};
pub use presence::{Client, ClientHeartbeat, ClientProgress, ClientValue, Clients, ParticipantRegistration, clients};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost::Message;

use crate::error::RtiResult;

/// Marker used by the `request_*` enumeration variants
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Empty {}

/// Encode a protobuf message into its text transport form
pub fn encode<M: Message>(message: &M) -> String {
    STANDARD.encode(message.encode_to_vec())
}

/// Decode a protobuf message from its text transport form
pub fn decode<M: Message + Default>(content: &str) -> RtiResult<M> {
    let bytes = STANDARD.decode(content.trim())?;
    Ok(M::decode(bytes.as_slice())?)
}

/// Short type tag recorded as a channel's data type (`Clients`, `Measurement`, ...)
pub fn type_tag<M>() -> String {
    let full = std::any::type_name::<M>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}
