//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Device identifier used for every exchange call
    pub device_id: String,

    /// Data directory (holds the agreement database)
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange base URL, with trailing slash
    pub url: String,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Per-request HTTP timeout in milliseconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_ms: u64,

    /// Fixed delay between retries of a transiently failed call
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

/// Edge device behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Directory holding `*.policy` files
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// How often the worker checks whether container sync has finished
    #[serde(default = "default_container_sync_poll")]
    pub container_sync_poll_ms: u64,

    /// Queue depth above which the worker warns about a backlog
    #[serde(default = "default_queue_soft_limit")]
    pub command_queue_soft_limit: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            container_sync_poll_ms: default_container_sync_poll(),
            command_queue_soft_limit: default_queue_soft_limit(),
        }
    }
}

/// Defaults for agreements that do not name a blockchain instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_bc_type")]
    pub default_type: String,

    #[serde(default = "default_bc_name")]
    pub default_name: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_type: default_bc_type(),
            default_name: default_bc_name(),
        }
    }
}

// Defaults
fn default_heartbeat_interval() -> u64 { 60 }
fn default_http_timeout() -> u64 { 20_000 }
fn default_retry_backoff() -> u64 { 10_000 }
fn default_policy_path() -> PathBuf { PathBuf::from("/etc/agreement-node/policy.d") }
fn default_container_sync_poll() -> u64 { 5_000 }
fn default_queue_soft_limit() -> usize { 100 }
fn default_bc_type() -> String { "ethereum".to_string() }
fn default_bc_name() -> String { "bluehorizon".to_string() }

impl ExchangeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl EdgeConfig {
    pub fn container_sync_poll(&self) -> Duration {
        Duration::from_millis(self.container_sync_poll_ms)
    }
}

impl Config {
    /// Parse a TOML configuration document.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(content)?;
        config.exchange.url = normalize_url(&config.exchange.url);
        Ok(config)
    }
}

/// Exchange paths are appended directly, so the base must end in `/`.
pub fn normalize_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                device_id: "device-1".to_string(),
                data_dir: PathBuf::from("/var/lib/agreement-node"),
            },
            exchange: ExchangeConfig {
                url: "http://localhost:8080/v1/".to_string(),
                heartbeat_interval_secs: default_heartbeat_interval(),
                http_timeout_ms: default_http_timeout(),
                retry_backoff_ms: default_retry_backoff(),
            },
            edge: EdgeConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}
