//! Local directory of channels, clients and measures seen on the bus

use std::collections::HashMap;

use tracing::debug;

use super::naming::is_identity_scoped;
use crate::proto::{Channel, ChannelUse, Client, Measure};

/// Everything this client has learned from peers or registered itself
#[derive(Debug, Default)]
pub struct Directory {
    pub known_channels: HashMap<String, Channel>,
    pub used_channels: HashMap<String, ChannelUse>,
    pub known_clients: HashMap<String, Client>,
    pub known_measures: HashMap<String, Measure>,
    pub used_measures: HashMap<String, Measure>,
}

impl Directory {
    /// Merge a peer's description of a channel into the canonical record
    pub fn discover_channel(&mut self, channel: &Channel) {
        match self.known_channels.get_mut(&channel.name) {
            Some(known) => known.merge_from(channel),
            None => {
                debug!(channel = %channel.name, "Directory::discover_channel: new channel");
                self.known_channels.insert(channel.name.clone(), channel.clone());
            }
        }
    }

    /// Record local publish or subscribe use of a channel
    ///
    /// Returns the channel when it was not previously known, so the caller
    /// can register and announce it.
    pub fn record_usage(&mut self, name: &str, publish: bool, data_type: &str) -> Option<Channel> {
        if is_identity_scoped(name) {
            return None;
        }
        let channel = self.known_channels.get(name).cloned().unwrap_or_else(|| Channel {
            data_type: data_type.to_string(),
            ..Channel::named(name)
        });
        let usage = self.used_channels.entry(name.to_string()).or_insert_with(|| ChannelUse {
            channel: Some(channel.clone()),
            ..Default::default()
        });
        if publish {
            usage.publish = true;
        } else {
            usage.subscribe = true;
        }
        if self.known_channels.contains_key(name) {
            None
        } else {
            Some(channel)
        }
    }

    /// Merge `channel` into the known description and attach the result to local usage
    ///
    /// Returns the merged record, or `None` for identity-scoped channels, which
    /// are never registered.
    pub fn register_channel(&mut self, channel: Channel) -> Option<Channel> {
        if is_identity_scoped(&channel.name) {
            return None;
        }
        self.discover_channel(&channel);
        let merged = self.known_channels.get(&channel.name).cloned()?;
        let usage = self.used_channels.entry(channel.name.clone()).or_default();
        usage.channel = Some(merged.clone());
        Some(merged)
    }

    pub fn unregister_channel(&mut self, name: &str) {
        self.known_channels.remove(name);
        self.used_channels.remove(name);
    }

    pub fn usage_snapshot(&self) -> Vec<ChannelUse> {
        let mut usage: Vec<ChannelUse> = self.used_channels.values().cloned().collect();
        usage.sort_by(|a, b| channel_name(a).cmp(channel_name(b)));
        usage
    }

    pub fn clients_by_application(&self, application: &str) -> Vec<Client> {
        self.known_clients
            .values()
            .filter(|c| c.application.eq_ignore_ascii_case(application))
            .cloned()
            .collect()
    }

    /// Definition used for `id`: local usage first, then peers
    pub fn lookup_measure(&self, id: &str) -> Option<Measure> {
        self.used_measures.get(id).or_else(|| self.known_measures.get(id)).cloned()
    }

    /// Store a locally used measure; returns true if the id was not known before
    pub fn register_measure(&mut self, measure: Measure) -> bool {
        self.used_measures.insert(measure.id.clone(), measure.clone());
        if self.known_measures.contains_key(&measure.id) {
            false
        } else {
            self.known_measures.insert(measure.id.clone(), measure);
            true
        }
    }
}

fn channel_name(usage: &ChannelUse) -> &str {
    usage.channel.as_ref().map(|c| c.name.as_str()).unwrap_or_default()
}
