//! Node configuration
//!
//! Loaded from `KV_*` environment variables, with defaults for everything
//! except the node id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::replication::NodeId;

pub const ENV_NODE_ID: &str = "KV_NODE_ID";
pub const ENV_API_ADDR: &str = "KV_API_ADDR";
pub const ENV_DATA_DIR: &str = "KV_DATA_DIR";
pub const ENV_SUBMIT_TIMEOUT_MS: &str = "KV_SUBMIT_TIMEOUT_MS";
pub const ENV_SNAPSHOT_INTERVAL_MS: &str = "KV_SNAPSHOT_INTERVAL_MS";
pub const ENV_SNAPSHOT_THRESHOLD: &str = "KV_SNAPSHOT_THRESHOLD";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for a key-value node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Address the client HTTP API listens on (default: 127.0.0.1:8080)
    pub api_addr: SocketAddr,
    /// Directory holding the persisted snapshot (default: ./data)
    pub data_dir: PathBuf,
    /// How long a write waits for commit (default: 500ms)
    pub submit_timeout: Duration,
    /// How often the compaction policy runs (default: 30s)
    pub snapshot_interval: Duration,
    /// Retained log entries before compacting (default: 1000)
    /// Set to 0 to disable compaction
    pub snapshot_threshold: u64,
}

impl NodeConfig {
    pub fn new(id: NodeId) -> Self {
        NodeConfig {
            id,
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("./data"),
            submit_timeout: Duration::from_millis(500),
            snapshot_interval: Duration::from_secs(30),
            snapshot_threshold: 1000,
        }
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = addr;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from any key/value source; unknown keys are ignored
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let id = vars
            .get(ENV_NODE_ID)
            .ok_or(ConfigError::Missing(ENV_NODE_ID))
            .and_then(|v| parse(ENV_NODE_ID, v))?;
        let mut config = NodeConfig::new(id);

        if let Some(v) = vars.get(ENV_API_ADDR) {
            config.api_addr = parse(ENV_API_ADDR, v)?;
        }
        if let Some(v) = vars.get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = vars.get(ENV_SUBMIT_TIMEOUT_MS) {
            let ms: u64 = parse(ENV_SUBMIT_TIMEOUT_MS, v)?;
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    name: ENV_SUBMIT_TIMEOUT_MS,
                    value: v.clone(),
                    reason: "must be positive".to_string(),
                });
            }
            config.submit_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = vars.get(ENV_SNAPSHOT_INTERVAL_MS) {
            config.snapshot_interval = Duration::from_millis(parse(ENV_SNAPSHOT_INTERVAL_MS, v)?);
        }
        if let Some(v) = vars.get(ENV_SNAPSHOT_THRESHOLD) {
            config.snapshot_threshold = parse(ENV_SNAPSHOT_THRESHOLD, v)?;
        }

        Ok(config)
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
