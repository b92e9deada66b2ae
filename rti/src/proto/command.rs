//! Command discovery and execution envelopes (`rti/commands`)

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandParameter {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub required: bool,
    #[prost(string, tag = "3")]
    pub description: String,
}

/// Advertisement of a command a client can execute
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, repeated, tag = "3")]
    pub arguments: Vec<CommandParameter>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteCommand {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    pub arguments: HashMap<String, String>,
    #[prost(string, tag = "3")]
    pub transaction_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandResponse {
    #[prost(string, tag = "1")]
    pub transaction_id: String,
    #[prost(bool, tag = "2")]
    pub failed: bool,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Commands {
    #[prost(oneof = "commands::Which", tags = "1, 2, 3, 4")]
    pub which: Option<commands::Which>,
}

pub mod commands {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Which {
        #[prost(message, tag = "1")]
        RequestCommands(super::super::Empty),
        #[prost(message, tag = "2")]
        Command(super::Command),
        #[prost(message, tag = "3")]
        Execute(super::ExecuteCommand),
        #[prost(message, tag = "4")]
        Response(super::CommandResponse),
    }
}

impl Commands {
    pub fn of(which: commands::Which) -> Self {
        Self { which: Some(which) }
    }
}
