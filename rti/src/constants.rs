//! Well-known channel names, capabilities and defaults

/// Library version announced in presence records and credentials
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Broker URL used when nothing else is configured
pub const DEFAULT_URL: &str = "ws://localhost:8000/";

/// Prefix marking identity-scoped channels (`@{clientId}:name`)
pub const IDENTITY_SCOPE_MARKER: char = '@';

/// Reserved channel names
pub mod channel {
    pub const INTERNAL_PREFIX: &str = "rti/";
    pub const CONTROL: &str = "rti/control";
    pub const CHANNELS: &str = "rti/channels";
    pub const CLIENTS: &str = "rti/clients";
    pub const MEASURES: &str = "rti/measures";
    pub const MEASUREMENT: &str = "rti/measurement";
    pub const COMMANDS: &str = "rti/commands";
}

/// Capability tags carried in presence records
pub mod capability {
    pub const RUNTIME_CONTROL: &str = "runtime";
    pub const SCENARIO: &str = "scenario";
    pub const TIME_SCALE: &str = "timescale";
    pub const LOG: &str = "log";
    pub const PLAYBACK: &str = "playback";
    pub const LAUNCH: &str = "launch";
}
