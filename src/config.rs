use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::distributed::ReplicationConfig;
use crate::erasure::{ErasureParams, MAX_TOTAL_SHARDS};
use crate::eviction::EvictionConfig;
use crate::sovereignty::SovereigntyMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0} is not set")]
    Missing(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A storage peer known at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: String,
    pub address: String,
}

// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_high_water")]
    pub high_water_bytes: u64,
    #[serde(default = "default_low_water")]
    pub low_water_bytes: u64,
    #[serde(default)]
    pub sovereignty: SovereigntyMode,
    /// Whether a laptop still pushes its own shards to custodians
    #[serde(default = "default_laptop_replication")]
    pub laptop_replication: bool,
    #[serde(default)]
    pub family_members: Vec<String>,
    #[serde(default)]
    pub cluster_members: Vec<String>,
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,
    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,
    #[serde(default)]
    pub trust_oracle_url: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_placement_concurrency")]
    pub placement_concurrency: usize,
    #[serde(default = "default_placement_attempts")]
    pub placement_max_attempts: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_high_water() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_low_water() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_laptop_replication() -> bool {
    true
}

fn default_data_shards() -> usize {
    4
}

fn default_parity_shards() -> usize {
    3
}

fn default_probe_interval() -> u64 {
    30
}

fn default_eviction_interval() -> u64 {
    60
}

fn default_sync_interval() -> u64 {
    60
}

fn default_peer_timeout() -> u64 {
    5000
}

fn default_placement_concurrency() -> usize {
    4
}

fn default_placement_attempts() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Defaults for everything but the node id
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr: default_listen_addr(),
            storage_root: default_storage_root(),
            high_water_bytes: default_high_water(),
            low_water_bytes: default_low_water(),
            sovereignty: SovereigntyMode::default(),
            laptop_replication: default_laptop_replication(),
            family_members: Vec::new(),
            cluster_members: Vec::new(),
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
            trust_oracle_url: None,
            peers: Vec::new(),
            probe_interval_secs: default_probe_interval(),
            eviction_interval_secs: default_eviction_interval(),
            sync_interval_secs: default_sync_interval(),
            peer_timeout_ms: default_peer_timeout(),
            placement_concurrency: default_placement_concurrency(),
            placement_max_attempts: default_placement_attempts(),
            log_level: default_log_level(),
        }
    }

    /// Load from `REACH_CONFIG_FILE` if it exists, otherwise from `REACH_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_path =
            env::var("REACH_CONFIG_FILE").unwrap_or_else(|_| "/etc/reach/node.yaml".to_string());
        if Path::new(&config_path).exists() {
            return Self::from_file(&config_path);
        }

        let node_id = env::var("REACH_NODE_ID")
            .map_err(|_| ConfigError::Missing("REACH_NODE_ID".to_string()))?;
        let mut config = Self::new(node_id);

        if let Ok(addr) = env::var("REACH_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(root) = env::var("REACH_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(v) = parse_var("REACH_HIGH_WATER_BYTES")? {
            config.high_water_bytes = v;
        }
        if let Some(v) = parse_var("REACH_LOW_WATER_BYTES")? {
            config.low_water_bytes = v;
        }
        if let Ok(mode) = env::var("REACH_SOVEREIGNTY") {
            config.sovereignty = serde_yaml::from_str(&mode)
                .map_err(|_| ConfigError::InvalidValue("REACH_SOVEREIGNTY".to_string(), mode))?;
        }
        if let Some(v) = parse_var("REACH_LAPTOP_REPLICATION")? {
            config.laptop_replication = v;
        }
        if let Ok(members) = env::var("REACH_FAMILY_MEMBERS") {
            config.family_members = split_list(&members);
        }
        if let Ok(members) = env::var("REACH_CLUSTER_MEMBERS") {
            config.cluster_members = split_list(&members);
        }
        if let Some(v) = parse_var("REACH_DATA_SHARDS")? {
            config.data_shards = v;
        }
        if let Some(v) = parse_var("REACH_PARITY_SHARDS")? {
            config.parity_shards = v;
        }
        if let Ok(url) = env::var("REACH_TRUST_ORACLE_URL") {
            config.trust_oracle_url = Some(url);
        }
        if let Ok(peers) = env::var("REACH_PEERS") {
            config.peers = parse_peers(&peers)?;
        }
        if let Some(v) = parse_var("REACH_PROBE_INTERVAL_SECS")? {
            config.probe_interval_secs = v;
        }
        if let Some(v) = parse_var("REACH_EVICTION_INTERVAL_SECS")? {
            config.eviction_interval_secs = v;
        }
        if let Some(v) = parse_var("REACH_SYNC_INTERVAL_SECS")? {
            config.sync_interval_secs = v;
        }
        if let Some(v) = parse_var("REACH_PEER_TIMEOUT_MS")? {
            config.peer_timeout_ms = v;
        }
        if let Some(v) = parse_var("REACH_PLACEMENT_CONCURRENCY")? {
            config.placement_concurrency = v;
        }
        if let Some(v) = parse_var("REACH_PLACEMENT_MAX_ATTEMPTS")? {
            config.placement_max_attempts = v;
        }
        if let Ok(level) = env::var("REACH_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    // Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let config: NodeConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".to_string()));
        }
        if self.low_water_bytes >= self.high_water_bytes {
            return Err(ConfigError::Invalid(format!(
                "low_water_bytes ({}) must be below high_water_bytes ({})",
                self.low_water_bytes, self.high_water_bytes
            )));
        }
        if self.data_shards == 0 {
            return Err(ConfigError::Invalid("data_shards must be at least 1".to_string()));
        }
        if self.data_shards + self.parity_shards > MAX_TOTAL_SHARDS {
            return Err(ConfigError::Invalid(format!(
                "data_shards + parity_shards must not exceed {}",
                MAX_TOTAL_SHARDS
            )));
        }
        Ok(())
    }

    pub fn erasure_params(&self) -> ErasureParams {
        ErasureParams {
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            peer_timeout: self.peer_timeout(),
            max_attempts: self.placement_max_attempts,
            concurrency: self.placement_concurrency,
            probe_interval: Duration::from_secs(self.probe_interval_secs.max(1)),
            ..ReplicationConfig::default()
        }
    }

    pub fn eviction_config(&self) -> EvictionConfig {
        EvictionConfig {
            high_water_bytes: self.high_water_bytes,
            low_water_bytes: self.low_water_bytes,
            interval: Duration::from_secs(self.eviction_interval_secs.max(1)),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Peers as a JSON array of `{peer_id, address}` or a `id=address` comma list
fn parse_peers(raw: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ConfigError::InvalidValue("REACH_PEERS".to_string(), e.to_string()));
    }
    split_list(trimmed)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((id, address)) => Ok(PeerConfig {
                peer_id: id.trim().to_string(),
                address: address.trim().to_string(),
            }),
            None => Err(ConfigError::InvalidValue("REACH_PEERS".to_string(), entry)),
        })
        .collect()
}
