//! Node configuration.
//!
//! Defaults cover a local single-node setup. An optional JSON file named by
//! `GHOST_CONFIG` replaces them, and a few environment variables override
//! individual values on top of that.

use serde::Deserialize;
use thiserror::Error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::blockchain::account::{Address, Amount, StateStore};
use crate::blockchain::pow::DEFAULT_CHECK_INTERVAL;

/// Environment variable naming the JSON config file
pub const CONFIG_PATH_VAR: &str = "GHOST_CONFIG";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub consensus: ConsensusParams,
    pub node: NodeSettings,
}

/// Rules every node on the network must agree on
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Leading zero hex digits required of every non-genesis block
    pub difficulty: u32,

    /// Largest reward a block may mint
    pub mining_reward: Amount,

    /// Nonce attempts between cancellation checks while mining
    pub cancel_check_interval: u64,

    /// Genesis time in microseconds since the Unix epoch
    pub genesis_timestamp: i64,

    /// Initial balances recorded in the genesis state
    pub genesis_allocations: BTreeMap<Address, Amount>,

    /// Rejected blocks remembered before the memo is cleared
    pub rejected_cache_capacity: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            difficulty: 2,
            mining_reward: 50,
            cancel_check_interval: DEFAULT_CHECK_INTERVAL,
            genesis_timestamp: 0,
            genesis_allocations: BTreeMap::from([(Address::from("main"), 10)]),
            rejected_cache_capacity: 4096,
        }
    }
}

impl ConsensusParams {
    /// State recorded in the genesis block
    pub fn genesis_state(&self) -> StateStore {
        StateStore::with_allocations(
            self.genesis_allocations
                .iter()
                .map(|(address, amount)| (address.clone(), *amount)),
        )
    }
}

/// Settings local to one node
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// This node's identity on the network
    pub address: String,
    pub http_host: String,
    pub http_port: u16,

    /// Directory for persisted blocks; in-memory only when unset
    pub data_dir: Option<PathBuf>,

    /// Address credited by the background miner; no miner when unset
    pub miner_address: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            address: "node-0".into(),
            http_host: "127.0.0.1".into(),
            http_port: 8080,
            data_dir: None,
            miner_address: None,
        }
    }
}

impl NodeConfig {
    /// Loads the config from `GHOST_CONFIG` (if set) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => NodeConfig::from_file(Path::new(&path))?,
            None => NodeConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        NodeConfig::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies `GHOST_HTTP_PORT`, `GHOST_DIFFICULTY` and `GHOST_MINER`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("GHOST_HTTP_PORT") {
            self.node.http_port = parse_override("GHOST_HTTP_PORT", &port)?;
        }
        if let Some(difficulty) = lookup("GHOST_DIFFICULTY") {
            self.consensus.difficulty = parse_override("GHOST_DIFFICULTY", &difficulty)?;
        }
        if let Some(miner) = lookup("GHOST_MINER") {
            self.node.miner_address = Some(miner).filter(|miner| !miner.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus.cancel_check_interval == 0 {
            return Err(ConfigError::Invalid(
                "cancel_check_interval must be positive".into(),
            ));
        }
        if self.consensus.difficulty > 64 {
            return Err(ConfigError::Invalid(format!(
                "difficulty {} exceeds the 64 hex digits of a hash",
                self.consensus.difficulty
            )));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();

        assert_eq!(config.consensus.difficulty, 2);
        assert_eq!(config.consensus.mining_reward, 50);
        assert_eq!(config.node.http_port, 8080);
        assert!(config.node.data_dir.is_none());
        assert_eq!(config.consensus.genesis_state().balance(&"main".into()), 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NodeConfig::from_json(
            r#"{
                "consensus": { "difficulty": 3, "genesis_allocations": { "alice": 100 } },
                "node": { "miner_address": "alice" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.consensus.difficulty, 3);
        assert_eq!(config.consensus.mining_reward, 50);
        assert_eq!(config.consensus.genesis_state().balance(&"alice".into()), 100);
        assert_eq!(config.consensus.genesis_state().balance(&"main".into()), 0);
        assert_eq!(config.node.miner_address.as_deref(), Some("alice"));
        assert_eq!(config.node.http_host, "127.0.0.1");
    }

    #[test]
    fn test_overrides() {
        let mut config = NodeConfig::default();
        config
            .apply_overrides(|key| match key {
                "GHOST_HTTP_PORT" => Some("9000".into()),
                "GHOST_DIFFICULTY" => Some("1".into()),
                "GHOST_MINER" => Some("bob".into()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.node.http_port, 9000);
        assert_eq!(config.consensus.difficulty, 1);
        assert_eq!(config.node.miner_address.as_deref(), Some("bob"));

        let err = config
            .apply_overrides(|key| (key == "GHOST_HTTP_PORT").then(|| "not-a-port".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_validation() {
        let mut config = NodeConfig::default();
        config.consensus.cancel_check_interval = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::default();
        config.consensus.difficulty = 65;
        assert!(config.validate().is_err());

        assert!(matches!(NodeConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
