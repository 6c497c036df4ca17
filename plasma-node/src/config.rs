//! Configuration for the child-chain node

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Block production
    pub chain: ChainConfig,

    /// Root chain connection
    pub root_chain: RootChainConfig,

    /// Peer-to-peer networking
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/plasma"),
            rocksdb: RocksDBConfig::default(),
            chain: ChainConfig::default(),
            root_chain: RootChainConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Block production configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Produce and submit blocks (operator node)
    pub authority: bool,

    /// Root-chain blocks between two submissions
    pub block_interval: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            authority: false,
            block_interval: 5,
        }
    }
}

/// Root chain connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootChainConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,

    /// Address of the plasma contract
    pub contract_address: String,

    /// Hex private key used to submit blocks
    pub operator_key: Option<String>,

    /// Chain id for signing root-chain transactions
    pub chain_id: u64,

    /// Event polling interval (milliseconds)
    pub poll_interval_ms: u64,

    /// First root-chain block to scan when no cursor is stored
    pub start_block: u64,
}

impl Default for RootChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract_address: String::new(),
            operator_key: None,
            chain_id: 1337,
            poll_interval_ms: 5_000,
            start_block: 0,
        }
    }
}

/// Peer-to-peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to listen on
    pub listen_host: String,

    /// Listen port (0 picks a free port)
    pub port: u16,

    /// Host other peers reach us at; forms our `host:port` identity
    pub external_host: String,

    /// Static peers (`host:port`)
    pub peers: Vec<String>,

    /// Peer maintenance interval (milliseconds)
    pub maintenance_interval_ms: u64,

    /// Peers asked per sync round
    pub sync_fanout: usize,

    /// Blocks returned per `REQ:BLOCKS`
    pub blocks_per_request: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: 30303,
            external_host: "127.0.0.1".to_string(),
            peers: Vec::new(),
            maintenance_interval_ms: 5_000,
            sync_fanout: 2,
            blocks_per_request: 5,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `PLASMA_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("PLASMA_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(url) = std::env::var("PLASMA_ROOT_CHAIN_RPC") {
            self.root_chain.rpc_url = url;
        }

        if let Ok(address) = std::env::var("PLASMA_ROOT_CHAIN_CONTRACT") {
            self.root_chain.contract_address = address;
        }

        if let Ok(key) = std::env::var("PLASMA_OPERATOR_KEY") {
            self.root_chain.operator_key = Some(key);
            self.chain.authority = true;
        }

        if let Ok(port) = std::env::var("PLASMA_P2P_PORT") {
            self.network.port = port
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid PLASMA_P2P_PORT: {}", e)))?;
        }

        if let Ok(host) = std::env::var("PLASMA_EXTERNAL_HOST") {
            self.network.external_host = host;
        }

        if let Ok(peers) = std::env::var("PLASMA_PEERS") {
            self.network.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(())
    }
}
