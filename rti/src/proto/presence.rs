//! Presence records and client directives (`rti/clients`)

use super::control::RuntimeState;

/// Self-describing presence record
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Client {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub application: String,
    #[prost(string, tag = "3")]
    pub application_version: String,
    #[prost(string, tag = "4")]
    pub engine_version: String,
    #[prost(string, tag = "5")]
    pub integration_version: String,
    #[prost(string, tag = "6")]
    pub client_library_version: String,
    #[prost(string, tag = "7")]
    pub host: String,
    #[prost(string, tag = "8")]
    pub station: String,
    #[prost(string, tag = "9")]
    pub user: String,
    #[prost(string, tag = "10")]
    pub participant: String,
    #[prost(string, tag = "11")]
    pub role: String,
    #[prost(string, tag = "12")]
    pub full_name: String,
    #[prost(enumeration = "RuntimeState", tag = "13")]
    pub state: i32,
    #[prost(string, repeated, tag = "14")]
    pub capabilities: Vec<String>,
}

/// Peer-issued directive assigning a participant to a client, host or station
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantRegistration {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub host: String,
    #[prost(string, tag = "3")]
    pub station: String,
    #[prost(string, tag = "4")]
    pub participant: String,
    #[prost(string, tag = "5")]
    pub role: String,
    #[prost(string, tag = "6")]
    pub full_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHeartbeat {
    #[prost(string, tag = "1")]
    pub client_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientProgress {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(uint32, tag = "2")]
    pub progress: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientValue {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(bool, tag = "3")]
    pub highlight: bool,
    #[prost(bool, tag = "4")]
    pub error: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Clients {
    #[prost(oneof = "clients::Which", tags = "1, 2, 3, 4, 5, 6")]
    pub which: Option<clients::Which>,
}

pub mod clients {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Which {
        #[prost(message, tag = "1")]
        RequestClients(super::super::Empty),
        #[prost(message, tag = "2")]
        Client(super::Client),
        #[prost(message, tag = "3")]
        RegisterParticipant(super::ParticipantRegistration),
        #[prost(message, tag = "4")]
        Heartbeat(super::ClientHeartbeat),
        #[prost(message, tag = "5")]
        Progress(super::ClientProgress),
        #[prost(message, tag = "6")]
        Value(super::ClientValue),
    }
}

impl Clients {
    pub fn of(which: clients::Which) -> Self {
        Self { which: Some(which) }
    }
}
