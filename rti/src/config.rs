//! Client configuration types and loading
//!
//! The core never reads files or the environment on its own; a
//! [`ClientConfig`] is resolved up front (usually with [`ClientConfig::load`])
//! and handed to [`crate::RtiClient::new`].

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::DEFAULT_URL;
use crate::transport::{SchedulingStrategy, TransportOptions};

/// Identity and behaviour of one client session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker URL; a missing scheme is filled in by [`normalize_url`]
    pub url: String,

    /// Application name announced in presence and credentials
    pub application: String,

    #[serde(rename = "application-version")]
    pub application_version: Option<String>,

    #[serde(rename = "engine-version")]
    pub engine_version: Option<String>,

    #[serde(rename = "integration-version")]
    pub integration_version: Option<String>,

    /// Stable client id; a random one is generated when absent
    #[serde(rename = "client-id")]
    pub client_id: Option<String>,

    /// Federation namespace; path separators are replaced with `_`
    pub federation: Option<String>,

    /// Host name; defaults to the machine hostname up to the first dot
    pub host: Option<String>,

    pub station: Option<String>,

    pub secret: Option<String>,

    pub user: Option<String>,

    pub password: Option<String>,

    pub participant: Option<String>,

    pub role: Option<String>,

    #[serde(rename = "full-name")]
    pub full_name: Option<String>,

    pub capabilities: Vec<String>,

    /// Consume the bus without announcing presence, channel or measure usage
    pub incognito: bool,

    pub scheduling: SchedulingStrategy,

    pub reconnect: bool,

    #[serde(rename = "reconnect-delay-ms")]
    pub reconnect_delay_ms: u64,

    /// Period of the missing-token watchdog
    #[serde(rename = "watchdog-tick-ms")]
    pub watchdog_tick_ms: u64,

    /// Period of the measurement flush loop
    #[serde(rename = "measurement-tick-ms")]
    pub measurement_tick_ms: u64,

    /// Factor applied to elapsed time when comparing against measure intervals
    #[serde(rename = "measurement-time-scale")]
    pub measurement_time_scale: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            application: "Rust".to_string(),
            application_version: None,
            engine_version: None,
            integration_version: None,
            client_id: None,
            federation: None,
            host: None,
            station: None,
            secret: None,
            user: None,
            password: None,
            participant: None,
            role: None,
            full_name: None,
            capabilities: Vec::new(),
            incognito: false,
            scheduling: SchedulingStrategy::OwnedThread,
            reconnect: true,
            reconnect_delay_ms: 3_000,
            watchdog_tick_ms: 1_000,
            measurement_tick_ms: 100,
            measurement_time_scale: 1.0,
        }
    }
}

impl ClientConfig {
    /// Default configuration for the named application
    pub fn for_application(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            ..Default::default()
        }
    }

    /// Load configuration with fallback chain, then apply `RTI_*` overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .rti.yml
        let local_config = PathBuf::from(".rti.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/rti/rti.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rti").join("rti.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Environment variables take precedence over file values
    pub fn apply_env(&mut self) {
        if let Some(url) = env_value("RTI_URL") {
            self.url = url;
        }
        if let Some(federation) = env_value("RTI_FEDERATION") {
            self.federation = Some(federation);
        }
        if let Some(secret) = env_value("RTI_SECRET") {
            self.secret = Some(secret);
        }
        if let Some(host) = env_value("RTI_HOST") {
            self.host = Some(host);
        }
        if let Some(station) = env_value("RTI_STATION") {
            self.station = Some(station);
        }
    }

    /// Broker URL with a scheme
    pub fn resolved_url(&self) -> String {
        normalize_url(&self.url)
    }

    /// Federation id with path separators replaced
    pub fn resolved_federation(&self) -> Option<String> {
        self.federation
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|f| f.replace('/', "_"))
    }

    /// Configured host, else the machine hostname up to the first dot
    pub fn resolved_host(&self) -> Option<String> {
        match self.host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) => Some(host.to_string()),
            None => machine_hostname(),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            reconnect: self.reconnect,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            watchdog_tick: Duration::from_millis(self.watchdog_tick_ms.max(1)),
        }
    }

    pub fn measurement_tick(&self) -> Duration {
        Duration::from_millis(self.measurement_tick_ms.max(1))
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Add a scheme to a bare broker address
///
/// Loopback addresses get `ws://`, anything else `wss://`.
pub fn normalize_url(url: &str) -> String {
    let url = if url.is_empty() { DEFAULT_URL } else { url };
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return url.to_string();
    }
    if url.starts_with("localhost") || url.starts_with("127.") {
        format!("ws://{}", url)
    } else {
        format!("wss://{}", url)
    }
}

fn machine_hostname() -> Option<String> {
    let name = nix::unistd::gethostname().ok()?;
    let name = name.to_string_lossy();
    let short = name.split('.').next().unwrap_or_default();
    if short.is_empty() { None } else { Some(short.to_string()) }
}
