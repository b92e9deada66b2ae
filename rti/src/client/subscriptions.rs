//! Local handler table: wire channel -> ordered handlers

use std::collections::HashMap;
use std::sync::Arc;

/// Untyped handler: `(logical_channel, content)`
pub type RawHandler = Arc<dyn Fn(&str, &str) -> eyre::Result<()> + Send + Sync>;

/// Handle returned by every `subscribe*` call, used to remove that handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    pub(crate) wire_channel: String,
    pub(crate) id: u64,
}

impl SubscriptionId {
    /// Channel name as carried on the wire
    pub fn wire_channel(&self) -> &str {
        &self.wire_channel
    }
}

struct Entry {
    channel: String,
    handlers: Vec<(u64, RawHandler)>,
}

/// Handlers grouped by wire channel, in registration order
#[derive(Default)]
pub struct Subscriptions {
    next_id: u64,
    entries: HashMap<String, Entry>,
}

impl Subscriptions {
    /// Add a handler; the flag is true when this is the channel's first handler
    pub fn add(&mut self, wire_channel: &str, channel: &str, handler: RawHandler) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = self.next_id;
        let first = !self.entries.contains_key(wire_channel);
        self.entries
            .entry(wire_channel.to_string())
            .or_insert_with(|| Entry {
                channel: channel.to_string(),
                handlers: Vec::new(),
            })
            .handlers
            .push((id, handler));
        (
            SubscriptionId {
                wire_channel: wire_channel.to_string(),
                id,
            },
            first,
        )
    }

    /// Remove one handler; true when it was the channel's last
    pub fn remove(&mut self, subscription: &SubscriptionId) -> bool {
        let Some(entry) = self.entries.get_mut(&subscription.wire_channel) else {
            return false;
        };
        entry.handlers.retain(|(id, _)| *id != subscription.id);
        if entry.handlers.is_empty() {
            self.entries.remove(&subscription.wire_channel);
            true
        } else {
            false
        }
    }

    /// Remove every handler on a channel; true if any were present
    pub fn remove_channel(&mut self, wire_channel: &str) -> bool {
        self.entries.remove(wire_channel).is_some()
    }

    /// Logical channel name and a snapshot of its handlers
    pub fn handlers(&self, wire_channel: &str) -> Option<(String, Vec<RawHandler>)> {
        self.entries.get(wire_channel).map(|entry| {
            (
                entry.channel.clone(),
                entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
            )
        })
    }

    pub fn handler_count(&self, wire_channel: &str) -> usize {
        self.entries.get(wire_channel).map(|e| e.handlers.len()).unwrap_or(0)
    }

    pub fn wire_channels(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
