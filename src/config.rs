// Node configuration

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub chain: ChainConfig,
    pub sync: SyncConfig,
    pub pool: PoolConfig,
    pub mining: MiningConfig,
}

impl NodeConfig {
    /// Read a JSON config file; absent fields keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Size of the in-memory block window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub max_height_offset_of_loaded_blocks: u32,
    pub max_height_offset_of_loaded_blocks_with_transactions: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_height_offset_of_loaded_blocks: 5000,
            max_height_offset_of_loaded_blocks_with_transactions: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub resync_interval_secs: u64,
    pub delay_after_failure_secs: u64,
    pub delay_if_busy_secs: u64,
    pub max_allowed_failures: u32,
    pub min_nodes: usize,
    pub preferred_height_respondents: usize,
    pub preferred_block_respondents: usize,
    pub min_block_respondents: usize,
}

impl SyncConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn delay_after_failure(&self) -> Duration {
        Duration::from_secs(self.delay_after_failure_secs)
    }

    pub fn delay_if_busy(&self) -> Duration {
        Duration::from_secs(self.delay_if_busy_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 6 * 60 * 60,
            delay_after_failure_secs: 5 * 60,
            delay_if_busy_secs: 5 * 60,
            max_allowed_failures: 5,
            min_nodes: 1,
            preferred_height_respondents: 10,
            preferred_block_respondents: 1,
            min_block_respondents: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub transaction_expiry_secs: u64,
    pub expiry_check_interval_secs: u64,
}

impl PoolConfig {
    pub fn transaction_expiry(&self) -> Duration {
        Duration::from_secs(self.transaction_expiry_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            transaction_expiry_secs: 14 * 24 * 60 * 60,
            expiry_check_interval_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Locking script paid by mined coinbases, hex encoded
    pub reward_script_hex: String,
    pub max_block_size: usize,
}

impl MiningConfig {
    pub fn reward_script(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.reward_script_hex)
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            reward_script_hex: String::new(),
            max_block_size: 1024 * 1024,
        }
    }
}
