use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::ProofOfWork;
use crate::node::SyncSettings;

/// Errors that can occur while loading the node configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a node needs to start, loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub consensus: ConsensusSection,
    pub sync: SyncSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "NodeSection::default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default = "NodeSection::default_data_dir")]
    pub data_dir: PathBuf,
    /// Hex encoded Ed25519 secret key; a fresh wallet is generated when absent
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "NodeSection::default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl NodeSection {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3020))
    }

    fn default_data_dir() -> PathBuf {
        PathBuf::from("data/node")
    }

    fn default_heartbeat_interval_secs() -> u64 {
        5
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            listen: Self::default_listen(),
            peers: Vec::new(),
            data_dir: Self::default_data_dir(),
            secret_key: None,
            heartbeat_interval_secs: Self::default_heartbeat_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "ConsensusSection::default_difficulty")]
    pub difficulty: usize,
    #[serde(default = "ConsensusSection::default_mining_cadence_secs")]
    pub mining_cadence_secs: u64,
    #[serde(default = "ConsensusSection::default_miner_startup_delay_secs")]
    pub miner_startup_delay_secs: u64,
    #[serde(default = "ConsensusSection::default_mining_reward")]
    pub mining_reward: f64,
}

impl ConsensusSection {
    fn default_difficulty() -> usize {
        4
    }

    fn default_mining_cadence_secs() -> u64 {
        60
    }

    fn default_miner_startup_delay_secs() -> u64 {
        120
    }

    fn default_mining_reward() -> f64 {
        50.0
    }
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            difficulty: Self::default_difficulty(),
            mining_cadence_secs: Self::default_mining_cadence_secs(),
            miner_startup_delay_secs: Self::default_miner_startup_delay_secs(),
            mining_reward: Self::default_mining_reward(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "SyncSection::default_min_connected_peers")]
    pub min_connected_peers: usize,
    #[serde(default = "SyncSection::default_pool_sync_timeout_secs")]
    pub pool_sync_timeout_secs: u64,
    #[serde(default = "SyncSection::default_startup_poll_millis")]
    pub startup_poll_millis: u64,
}

impl SyncSection {
    fn default_min_connected_peers() -> usize {
        2
    }

    fn default_pool_sync_timeout_secs() -> u64 {
        15
    }

    fn default_startup_poll_millis() -> u64 {
        500
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        SyncSection {
            min_connected_peers: Self::default_min_connected_peers(),
            pool_sync_timeout_secs: Self::default_pool_sync_timeout_secs(),
            startup_poll_millis: Self::default_startup_poll_millis(),
        }
    }
}

impl NodeConfig {
    /// Reads a TOML file; missing keys fall back to their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus.mining_cadence_secs == 0 {
            return Err(ConfigError::Invalid(
                "mining_cadence_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.pool_sync_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "pool_sync_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.consensus.difficulty > 64 {
            return Err(ConfigError::Invalid(format!(
                "difficulty {} exceeds the 64 hex characters of a hash",
                self.consensus.difficulty
            )));
        }
        if self.node.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn proof_of_work(&self) -> ProofOfWork {
        ProofOfWork {
            difficulty: self.consensus.difficulty,
            mining_cadence: Duration::from_secs(self.consensus.mining_cadence_secs),
            miner_startup_delay: Duration::from_secs(self.consensus.miner_startup_delay_secs),
            mining_reward: self.consensus.mining_reward,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            min_connected_peers: self.sync.min_connected_peers,
            pool_sync_timeout: Duration::from_secs(self.sync.pool_sync_timeout_secs),
            startup_poll: Duration::from_millis(self.sync.startup_poll_millis),
        }
    }
}
