//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::arch::ArchSynonyms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Alternate architecture names accepted in registration requests
    #[serde(default)]
    pub arch: ArchSynonyms,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Base URL of the exchange API
    #[serde(default = "default_exchange_url")]
    pub url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            url: default_exchange_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Where policy documents are written. Relative paths are under the data directory.
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// Agreement cap for shareable services when the node authors its own policy
    #[serde(default = "default_max_agreements")]
    pub max_agreements: u32,

    /// RAM in MB given to services registered without a compute attribute
    #[serde(default = "default_service_ram")]
    pub default_service_ram_mb: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            max_agreements: default_max_agreements(),
            default_service_ram_mb: default_service_ram(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Quiet period in seconds before the resource worker runs maintenance
    #[serde(default = "default_resource_idle")]
    pub resource_idle_secs: u64,

    /// How long archived service definitions are kept, in seconds
    #[serde(default = "default_gc_retention")]
    pub gc_retention_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            resource_idle_secs: default_resource_idle(),
            gc_retention_secs: default_gc_retention(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/edge-agent") }
fn default_exchange_url() -> String { "http://localhost:8080/v1".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_policy_path() -> PathBuf { PathBuf::from("policy.d") }
fn default_max_agreements() -> u32 { 5 }
fn default_service_ram() -> i64 { 128 }
fn default_resource_idle() -> u64 { 3600 }
fn default_gc_retention() -> u64 { 24 * 3600 }

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            exchange: ExchangeConfig::default(),
            policy: PolicyConfig::default(),
            workers: WorkersConfig::default(),
            arch: ArchSynonyms::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join("agent.db")
    }

    pub fn policy_dir(&self) -> PathBuf {
        self.node.data_dir.join(&self.policy.policy_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange.request_timeout_secs)
    }

    pub fn resource_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.workers.resource_idle_secs)
    }

    pub fn gc_retention(&self) -> Duration {
        Duration::from_secs(self.workers.gc_retention_secs)
    }
}
