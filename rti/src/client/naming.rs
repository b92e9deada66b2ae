//! Federation-aware channel naming

use crate::constants::IDENTITY_SCOPE_MARKER;

/// True for private per-client channels (`@{clientId}:name`)
pub fn is_identity_scoped(channel: &str) -> bool {
    channel.starts_with(IDENTITY_SCOPE_MARKER)
}

/// Name a logical channel carries on the wire
///
/// With a federation configured every channel except identity-scoped ones
/// becomes `//{federation}/{channel}`.
pub fn wire_name(federation: Option<&str>, channel: &str) -> String {
    match federation {
        Some(federation) if !is_identity_scoped(channel) => format!("//{}/{}", federation, channel),
        _ => channel.to_string(),
    }
}

/// Identity-scoped form of `channel` for `client_id`
pub fn identity_scoped(client_id: &str, channel: &str) -> String {
    format!("{}{}:{}", IDENTITY_SCOPE_MARKER, client_id, channel)
}
