//! Rollchain configuration
//!
//! ## Configuration Sources (in precedence order)
//!
//! 1. Environment overrides (`ROLLCHAIN_IPFS_API_URL`, `ROLLCHAIN_IPFS_GATEWAY_URL`,
//!    `ROLLCHAIN_USE_IPFS`)
//! 2. `rollchain.yml` passed on the command line
//! 3. Built-in defaults
//!
//! ```yaml
//! session:
//!   ttl_minutes: 5
//! ledger:
//!   max_append_attempts: 8
//! bridges:
//!   timeout_seconds: 30
//!   trust_anchor:
//!     backend: process
//!     command: node
//!     args: ["server/eth_runner.js"]
//!   content_store:
//!     backend: ipfs
//!     api_url: http://127.0.0.1:5001
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub bridges: BridgeConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of an issued session token
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes.max(1))
    }
}

/// Retry discipline for the optimistic ledger append
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_max_append_attempts")]
    pub max_append_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_append_attempts: default_max_append_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Upper bound for any single bridge call
    #[serde(default = "default_bridge_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub trust_anchor: TrustAnchorConfig,

    #[serde(default)]
    pub content_store: ContentStoreConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_bridge_timeout(),
            trust_anchor: TrustAnchorConfig::default(),
            content_store: ContentStoreConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        if self.timeout_seconds == 0 {
            warn!("bridges.timeout_seconds=0 is not allowed; using 1 second");
        }
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustAnchorBackend {
    /// In-process anchor (state kept alongside the store snapshot)
    Local,
    /// Out-of-process runner speaking `<action> <json>` on argv and JSON on stdout
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    #[serde(default = "default_anchor_backend")]
    pub backend: TrustAnchorBackend,

    #[serde(default = "default_runner_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TrustAnchorConfig {
    fn default() -> Self {
        Self {
            backend: default_anchor_backend(),
            command: default_runner_command(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStoreBackend {
    Local,
    Ipfs,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    #[serde(default = "default_content_backend")]
    pub backend: ContentStoreBackend,

    #[serde(default = "default_ipfs_api_url")]
    pub api_url: String,

    #[serde(default = "default_ipfs_gateway_url")]
    pub gateway_url: String,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_content_backend(),
            api_url: default_ipfs_api_url(),
            gateway_url: default_ipfs_gateway_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Snapshot file used by the CLI; `None` means the platform data dir
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_ttl_minutes() -> i64 {
    5
}

fn default_max_append_attempts() -> u32 {
    8
}

fn default_backoff_base_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    640
}

fn default_bridge_timeout() -> u64 {
    30
}

fn default_anchor_backend() -> TrustAnchorBackend {
    TrustAnchorBackend::Local
}

fn default_runner_command() -> String {
    "node".to_string()
}

fn default_content_backend() -> ContentStoreBackend {
    ContentStoreBackend::Local
}

fn default_ipfs_api_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_ipfs_gateway_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl CheckinConfig {
    /// Load from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: CheckinConfig =
            serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded config from {}", path.display());
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` when given, otherwise defaults plus environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = CheckinConfig::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ROLLCHAIN_IPFS_API_URL") {
            self.bridges.content_store.api_url = url;
        }
        if let Ok(url) = std::env::var("ROLLCHAIN_IPFS_GATEWAY_URL") {
            self.bridges.content_store.gateway_url = url;
        }
        if let Ok(flag) = std::env::var("ROLLCHAIN_USE_IPFS") {
            match flag.to_lowercase().as_str() {
                "true" | "1" => self.bridges.content_store.backend = ContentStoreBackend::Ipfs,
                "false" | "0" => {
                    self.bridges.content_store.backend = ContentStoreBackend::Disabled
                }
                other => warn!("Ignoring ROLLCHAIN_USE_IPFS={}", other),
            }
        }
    }
}
