//! Configuration for a peerlink node
//!
//! Sources, highest precedence first:
//! 1. CLI arguments
//! 2. Environment variables (PEERLINK_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::{plugin_id, CoordinatorSettings};
use crate::discovery::BROKER_SERVICE_ID;
use crate::error::{Error, Result};
use crate::protocol::BROADCAST;
use crate::transport::{FailoverPolicy, FailoverUri, MEMORY_SCHEME};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub node: NodeSettings,
    pub broker: BrokerSettings,
    pub coordination: CoordinationSettings,
    pub relay: RelaySettings,
    pub logging: LoggingSettings,
}

/// Identity of this node on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Server identifier (defaults to the hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    pub plugin_vendor: String,

    pub plugin_handle: String,
}

/// Where the broker lives and how hard to try reaching it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Discovery service id brokers announce themselves under
    pub service_id: String,

    /// Static broker address, announced to the local directory at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    pub initial_reconnect_delay_ms: u64,

    pub startup_max_reconnect_attempts: u32,

    pub max_reconnect_attempts: u32,

    /// Per-attempt WebSocket connect timeout
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    /// Delay between start and the first announcement
    pub settle_delay_ms: u64,

    /// Heartbeat rate in seconds (0 = disabled)
    pub ping_rate_secs: u64,

    /// Capacity of the coordinator event queue
    pub event_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Listen address for `peerlink relay`
    pub listen: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (optional, logs to stdout if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Maximum number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logs
    pub json_format: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            server_id: None,
            plugin_vendor: "peerlink".to_string(),
            plugin_handle: "node".to_string(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            service_id: BROKER_SERVICE_ID.to_string(),
            address: None,
            initial_reconnect_delay_ms: 100,
            startup_max_reconnect_attempts: 10,
            max_reconnect_attempts: 20,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1000,
            ping_rate_secs: 0,
            event_queue_size: 256,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl PeerlinkConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = match Self::find_config_file(config_path)? {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                    path: path.clone(),
                    source: e,
                })?;
                let config = Self::from_toml(&content)?;
                info!(path = %path.display(), "Configuration loaded from file");
                config
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Parse without env overrides or validation
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let mut search_paths = vec![PathBuf::from("peerlink.toml")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("peerlink").join("peerlink.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".peerlink").join("peerlink.toml"));
        }
        search_paths.push(PathBuf::from("/etc/peerlink/peerlink.toml"));

        for path in search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PEERLINK_SERVER_ID") {
            self.node.server_id = Some(val);
        }
        if let Ok(val) = std::env::var("PEERLINK_PLUGIN_VENDOR") {
            self.node.plugin_vendor = val;
        }
        if let Ok(val) = std::env::var("PEERLINK_PLUGIN_HANDLE") {
            self.node.plugin_handle = val;
        }

        if let Ok(val) = std::env::var("PEERLINK_BROKER_SERVICE_ID") {
            self.broker.service_id = val;
        }
        if let Ok(val) = std::env::var("PEERLINK_BROKER_ADDRESS") {
            self.broker.address = Some(val);
        }
        if let Some(n) = env_number("PEERLINK_INITIAL_RECONNECT_DELAY_MS") {
            self.broker.initial_reconnect_delay_ms = n;
        }
        if let Some(n) = env_number("PEERLINK_STARTUP_MAX_RECONNECT_ATTEMPTS") {
            self.broker.startup_max_reconnect_attempts = n;
        }
        if let Some(n) = env_number("PEERLINK_MAX_RECONNECT_ATTEMPTS") {
            self.broker.max_reconnect_attempts = n;
        }
        if let Some(n) = env_number("PEERLINK_CONNECT_TIMEOUT_MS") {
            self.broker.connect_timeout_ms = n;
        }

        if let Some(n) = env_number("PEERLINK_SETTLE_DELAY_MS") {
            self.coordination.settle_delay_ms = n;
        }
        if let Some(n) = env_number("PEERLINK_PING_RATE_SECS") {
            self.coordination.ping_rate_secs = n;
        }

        if let Ok(val) = std::env::var("PEERLINK_RELAY_LISTEN") {
            self.relay.listen = val;
        }

        if let Ok(val) = std::env::var("PEERLINK_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("PEERLINK_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("PEERLINK_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref id) = self.node.server_id {
            if id.trim().is_empty() {
                return Err(Error::config_field_invalid("node.server_id", "server id cannot be empty"));
            }
            if id == BROADCAST {
                return Err(Error::config_field_invalid(
                    "node.server_id",
                    "'*' is reserved for broadcast",
                ));
            }
        }
        if self.node.plugin_vendor.trim().is_empty() {
            return Err(Error::config_field_invalid("node.plugin_vendor", "plugin vendor cannot be empty"));
        }
        if self.node.plugin_handle.trim().is_empty() {
            return Err(Error::config_field_invalid("node.plugin_handle", "plugin handle cannot be empty"));
        }

        if self.broker.service_id.trim().is_empty() {
            return Err(Error::config_field_invalid("broker.service_id", "service id cannot be empty"));
        }
        if let Some(ref address) = self.broker.address {
            validate_address(address)?;
        }

        if self.coordination.event_queue_size == 0 {
            return Err(Error::config_field_invalid(
                "coordination.event_queue_size",
                "event queue needs room for at least one event",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Configured server id, or the hostname, or a random one
    pub fn server_id(&self) -> String {
        if let Some(ref id) = self.node.server_id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty() && h != BROADCAST)
            .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]))
    }

    pub fn plugin_id(&self) -> String {
        plugin_id(&self.node.plugin_vendor, &self.node.plugin_handle)
    }

    pub fn failover_policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            initial_reconnect_delay: Duration::from_millis(self.broker.initial_reconnect_delay_ms),
            startup_max_reconnect_attempts: self.broker.startup_max_reconnect_attempts,
            max_reconnect_attempts: self.broker.max_reconnect_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.connect_timeout_ms)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings::new(self.server_id(), self.plugin_id())
            .with_settle_delay(Duration::from_millis(self.coordination.settle_delay_ms))
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn validate_address(address: &str) -> Result<()> {
    let uri = FailoverUri::from_address(address, &FailoverPolicy::default())?;
    for url in &uri.urls {
        if !url.starts_with("ws://") && !url.starts_with(MEMORY_SCHEME) {
            return Err(Error::config_field_invalid(
                "broker.address",
                format!("unsupported broker url '{}': expected ws:// or memory://", url),
            ));
        }
    }
    Ok(())
}

fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Write a commented default configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".peerlink")
                .join("peerlink.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

fn generate_default_config() -> String {
    r#"# peerlink node configuration

[node]
# Server identifier; defaults to the hostname
# server_id = "server-a"

# Plugin identity, combined as <vendor>_<handle>
plugin_vendor = "peerlink"
plugin_handle = "node"

[broker]
# Discovery service id brokers announce themselves under
service_id = "message_broker"

# Static broker address: ws://host:port, memory://name,
# or failover:(ws://a:7400,ws://b:7400)
# address = "ws://127.0.0.1:7400"

# Delay before the second connection round, doubled per round
initial_reconnect_delay_ms = 100

# Extra rounds when opening a connection
startup_max_reconnect_attempts = 10

# Extra rounds when an established connection drops
max_reconnect_attempts = 20

# Per-attempt connect timeout
connect_timeout_ms = 5000

[coordination]
# Wait before announcing, so the connection can settle
settle_delay_ms = 1000

# Heartbeat rate in seconds (0 = disabled)
ping_rate_secs = 0

# Capacity of the coordinator event queue
event_queue_size = 256

[relay]
# Listen address for `peerlink relay`
listen = "127.0.0.1:7400"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.peerlink/logs/peerlink.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
