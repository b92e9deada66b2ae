//! Channel discovery and usage records (`rti/channels`)

/// Channel metadata, canonical per name
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Channel {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub data_type: String,
    #[prost(bool, tag = "3")]
    pub ephemeral: bool,
    #[prost(bool, tag = "4")]
    pub state: bool,
    #[prost(bool, tag = "5")]
    pub first_field_id: bool,
}

impl Channel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Merge another description of the same channel into this one.
    ///
    /// Flags only ever turn on; the data type is filled once and then kept.
    pub fn merge_from(&mut self, other: &Channel) {
        if self.data_type.is_empty() && !other.data_type.is_empty() {
            self.data_type = other.data_type.clone();
        }
        self.ephemeral |= other.ephemeral;
        self.state |= other.state;
        self.first_field_id |= other.first_field_id;
    }
}

/// A channel plus the local publish/subscribe directions
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ChannelUse {
    #[prost(message, optional, tag = "1")]
    pub channel: Option<Channel>,
    #[prost(bool, tag = "2")]
    pub publish: bool,
    #[prost(bool, tag = "3")]
    pub subscribe: bool,
}

/// Full usage snapshot of one client
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelUsage {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(message, repeated, tag = "2")]
    pub usage: Vec<ChannelUse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Channels {
    #[prost(oneof = "channels::Which", tags = "1, 2, 3")]
    pub which: Option<channels::Which>,
}

pub mod channels {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Which {
        #[prost(message, tag = "1")]
        RequestChannelUsage(super::super::Empty),
        #[prost(message, tag = "2")]
        ChannelUsage(super::ChannelUsage),
        #[prost(message, tag = "3")]
        Channel(super::Channel),
    }
}

impl Channels {
    pub fn of(which: channels::Which) -> Self {
        Self { which: Some(which) }
    }
}
