use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::info;

use crate::blockchain::Address;

/// Settings for one node process, read from the environment (and `.env`)
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub node_host: String,
    pub node_port: u16,
    pub bootstrap_node: String,
    pub miner_address: Option<Address>,
    pub mine_threshold: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: "3000".to_string(),
            data_dir: PathBuf::from("data"),
            api_host: "127.0.0.1".to_string(),
            api_port: 8080,
            node_host: "localhost".to_string(),
            node_port: 3000,
            bootstrap_node: "localhost:3000".to_string(),
            miner_address: None,
            mine_threshold: 2,
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, value)),
        Err(_) => Ok(default),
    }
}

impl NodeConfig {
    /// Loads `.env` if present, then reads every setting from the environment
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let miner_address = match env::var("MINER_ADDRESS") {
            Ok(value) if !value.is_empty() => Some(
                Address::from_str(&value).with_context(|| format!("MINER_ADDRESS {} is not valid", value))?,
            ),
            _ => None,
        };

        let config = NodeConfig {
            node_id: var_or("NODE_ID", &defaults.node_id),
            data_dir: PathBuf::from(var_or("DATA_DIR", "data")),
            api_host: var_or("API_HOST", &defaults.api_host),
            api_port: parse_var("API_PORT", defaults.api_port)?,
            node_host: var_or("NODE_HOST", &defaults.node_host),
            node_port: parse_var("NODE_PORT", defaults.node_port)?,
            bootstrap_node: var_or("BOOTSTRAP_NODE", &defaults.bootstrap_node),
            miner_address,
            mine_threshold: parse_var("MINE_THRESHOLD", defaults.mine_threshold)?,
        };

        info!("Loaded configuration for node {}", config.node_id);
        Ok(config)
    }

    /// Directory holding this node's block store
    pub fn blocks_path(&self) -> PathBuf {
        self.data_dir.join(format!("blocks_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallets_{}.dat", self.node_id))
    }

    /// Gossip address advertised to peers
    pub fn node_address(&self) -> String {
        format!("{}:{}", self.node_host, self.node_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_node_id() {
        let config = NodeConfig {
            node_id: "3001".to_string(),
            data_dir: PathBuf::from("/tmp/chain"),
            ..NodeConfig::default()
        };

        assert_eq!(config.blocks_path(), PathBuf::from("/tmp/chain/blocks_3001"));
        assert_eq!(config.wallet_path(), PathBuf::from("/tmp/chain/wallets_3001.dat"));
    }

    #[test]
    fn test_default_addresses() {
        let config = NodeConfig::default();
        assert_eq!(config.node_address(), "localhost:3000");
        assert_eq!(config.node_address(), config.bootstrap_node);
        assert_eq!(config.mine_threshold, 2);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("UTXO_CHAIN_TEST_PORT", "not-a-port");
        assert!(parse_var::<u16>("UTXO_CHAIN_TEST_PORT", 1).is_err());

        env::set_var("UTXO_CHAIN_TEST_PORT", "4000");
        assert_eq!(parse_var::<u16>("UTXO_CHAIN_TEST_PORT", 1).unwrap(), 4000);

        assert_eq!(parse_var::<u16>("UTXO_CHAIN_TEST_UNSET", 7).unwrap(), 7);
        env::remove_var("UTXO_CHAIN_TEST_PORT");
    }
}
