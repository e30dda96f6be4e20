use std::path::Path;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::TargetRule;
use crate::types::{decimal, Address};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Chain parameters every node of a network must agree on, plus a few
/// local knobs. Missing fields fall back to [`ChainConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainConfig {
    #[serde(with = "decimal")]
    pub block_reward: BigUint,
    /// Cap on accumulated `contractGas` per block.
    #[serde(with = "decimal")]
    pub block_gas_limit: BigUint,
    /// Minimum `gas` a transaction must pay.
    #[serde(with = "decimal")]
    pub min_gas: BigUint,
    #[serde(with = "decimal")]
    pub initial_supply: BigUint,
    /// Holder of the initial supply and coinbase of the genesis block.
    pub first_account: Address,
    pub genesis_timestamp: u64,
    /// Target interval between blocks, in milliseconds.
    pub block_time_ms: u64,
    /// Retarget step is `max(1, difficulty / retarget_divisor)`.
    pub retarget_divisor: u64,
    pub target_rule: TargetRule,
    pub checked_block_capacity: usize,
    pub pool_capacity: usize,
    pub mining_interval_ms: u64,
    pub max_peers: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            block_reward: BigUint::from(297_000_000_000_000u64),
            block_gas_limit: BigUint::from(50_000_000_000_000u64),
            min_gas: BigUint::from(2_000_000_000u64),
            initial_supply: BigUint::from(10u64).pow(32),
            first_account: "52472d59e3c01bc2cf9496c959d924ce5f469d4e097c395f5605f70633e44a28"
                .to_string(),
            genesis_timestamp: 1_700_000_000_000,
            block_time_ms: 30_000,
            retarget_divisor: 16,
            target_rule: TargetRule::Numeric,
            checked_block_capacity: 4096,
            pool_capacity: 10_000,
            mining_interval_ms: 10_000,
            max_peers: 10,
        }
    }
}

impl ChainConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: ChainConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_time_ms == 0 {
            return Err(ConfigError::Invalid("blockTimeMs must be positive".into()));
        }
        if self.retarget_divisor == 0 {
            return Err(ConfigError::Invalid("retargetDivisor must be positive".into()));
        }
        if self.checked_block_capacity == 0 {
            return Err(ConfigError::Invalid("checkedBlockCapacity must be positive".into()));
        }
        if self.first_account.is_empty() {
            return Err(ConfigError::Invalid("firstAccount must be set".into()));
        }
        Ok(())
    }
}
