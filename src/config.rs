//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `sense-hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ClusterConfig: Role ("hub" or "spoke") and node identity.
//!     - HubConfig: Listening port, bind retries, connection limit, labels.
//!     - SpokeConfig: Hub address, retry budgets, interface, sensors.
//!     - StatusConfig: The hub's http status page.
//!     - LoggingConfig: Default log filter.
//!
//! ==============================================================================

use crate::client::RetryPolicy;
use crate::protocol::{DEFAULT_PORT, READ_BUFFER_SIZE};
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub spoke: SpokeConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Hub,
    Spoke,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hub" => Ok(Role::Hub),
            "spoke" => Ok(Role::Spoke),
            other => Err(format!("unknown role {:?} (expected hub or spoke)", other)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Hub => f.write_str("hub"),
            Role::Spoke => f.write_str("spoke"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    pub role: Role,
    pub node_id: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: Role::Hub,
            node_id: "hub-01".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HubConfig {
    pub bind_host: String,
    pub port: u16,
    pub bind_attempts: u32,
    pub max_connections: usize,
    pub read_buffer: usize,
    pub labels: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            bind_attempts: 10,
            max_connections: 64,
            read_buffer: READ_BUFFER_SIZE,
            labels: crate::registry::default_labels(),
        }
    }
}

impl HubConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpokeConfig {
    pub server_ip: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub connect_backoff_seconds: u64,
    pub send_attempts: u32,
    pub interface: String,
    pub ping_count: u32,
    pub sensors: Vec<SensorEntry>,
}

impl Default for SpokeConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_attempts: 10,
            connect_backoff_seconds: 10,
            send_attempts: 10,
            interface: "wlan0".to_string(),
            ping_count: 3,
            sensors: Vec::new(),
        }
    }
}

impl SpokeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            connect_attempts: self.connect_attempts,
            connect_backoff: Duration::from_secs(self.connect_backoff_seconds),
            send_attempts: self.send_attempts,
        }
    }
}

/// one 1-wire probe and the label its readings are sent under
#[derive(Debug, Deserialize, Clone)]
pub struct SensorEntry {
    pub label: String,
    /// 1-wire device id such as "28-0316a2795bff", or "mock"
    pub device_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("sense-hub.toml"),
            std::path::PathBuf::from("..").join("config").join("sense-hub.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    fn validate(&self) -> anyhow::Result<()> {
        for label in self
            .hub
            .labels
            .iter()
            .chain(self.spoke.sensors.iter().map(|s| &s.label))
        {
            anyhow::ensure!(
                label.len() == crate::protocol::LABEL_LEN && label.is_ascii(),
                "label {:?} must be exactly {} ascii characters",
                label,
                crate::protocol::LABEL_LEN
            );
        }
        anyhow::ensure!(self.hub.bind_attempts > 0, "hub.bind_attempts must be at least 1");
        anyhow::ensure!(
            (1..=tokio::sync::Semaphore::MAX_PERMITS).contains(&self.hub.max_connections),
            "hub.max_connections must be between 1 and {}",
            tokio::sync::Semaphore::MAX_PERMITS
        );
        anyhow::ensure!(self.hub.read_buffer > 0, "hub.read_buffer must be at least 1");
        anyhow::ensure!(
            self.spoke.connect_attempts > 0 && self.spoke.send_attempts > 0,
            "spoke retry budgets must be at least 1"
        );
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          SENSE HUB CONFIGURATION        │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Role: {}", self.cluster.role);
        println!("│ Node ID: {}", self.cluster.node_id);
        match self.cluster.role {
            Role::Hub => {
                println!("│ Listen: {}", self.hub.bind_address());
                println!("│ Max Connections: {}", self.hub.max_connections);
                println!("│ Labels: {}", self.hub.labels.len());
                if self.status.enabled {
                    println!("│ Status Page: http://{}", self.status.bind);
                }
            }
            Role::Spoke => {
                println!("│ Hub: {}:{}", self.spoke.server_ip, self.spoke.port);
                println!("│ Sensors: {}", self.spoke.sensors.len());
            }
        }
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
