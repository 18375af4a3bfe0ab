use crate::consensus::params::ConsensusParams;
use crate::mining::MinerConfig;
use crate::network::sync::SyncConfig;
use crate::network::transport::TcpTransport;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub mining: MiningConfig,
    pub storage: StorageConfig,
    pub consensus: ConsensusParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// Address peers should dial; derived from `listen_addr` when unset.
    pub advertise_addr: Option<String>,
    pub peers: Vec<String>,
    pub max_peers: usize,
    pub sync_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub chain_chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub enabled: bool,
    pub address: Option<String>,
    pub max_block_transactions: usize,
    pub tip_check_interval: u64,
    pub max_nonces_per_round: u64,
    pub max_pending_transactions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Replay the stored chain with full validation when opening it.
    pub verify_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_dir = PathBuf::from(home_dir).join(".minicoin").join("data");

        Self {
            network: NetworkConfig {
                listen_addr: "0.0.0.0:8333".to_string(),
                advertise_addr: None,
                peers: vec![],
                max_peers: 32,
                sync_interval_secs: 10,
                connect_timeout_secs: 5,
                request_timeout_secs: 10,
                retry_base_secs: 5,
                retry_max_secs: 300,
                chain_chunk_size: 500,
            },
            mining: MiningConfig {
                enabled: false,
                address: None,
                max_block_transactions: 1_000,
                tip_check_interval: 1_024,
                max_nonces_per_round: 1 << 22,
                max_pending_transactions: 5_000,
            },
            storage: StorageConfig {
                data_dir,
                verify_on_startup: false,
            },
            consensus: ConsensusParams::default(),
        }
    }
}

impl Config {
    /// Local network settings: regtest consensus, loopback listener, fast sync.
    pub fn regtest(data_dir: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.network.listen_addr = "127.0.0.1:18444".to_string();
        config.network.sync_interval_secs = 1;
        config.network.retry_base_secs = 1;
        config.network.retry_max_secs = 10;
        config.storage.data_dir = data_dir.as_ref().to_path_buf();
        config.consensus = ConsensusParams::regtest();
        config
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Reads `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        let home_dir = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home_dir).join(".minicoin").join("config.json")
    }
}

impl NetworkConfig {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            max_peers: self.max_peers,
            retry_base: Duration::from_secs(self.retry_base_secs),
            retry_max: Duration::from_secs(self.retry_max_secs),
            chain_chunk: self.chain_chunk_size,
        }
    }

    pub fn transport(&self) -> TcpTransport {
        TcpTransport::new(
            Duration::from_secs(self.connect_timeout_secs.max(1)),
            Duration::from_secs(self.request_timeout_secs.max(1)),
        )
    }

    /// The address announced to peers. A wildcard listener is not dialable,
    /// so it is only announced through `advertise_addr`.
    pub fn advertised_addr(&self) -> Option<String> {
        if let Some(addr) = &self.advertise_addr {
            return Some(addr.clone());
        }
        match self.listen_addr.parse::<SocketAddr>() {
            Ok(addr) if !addr.ip().is_unspecified() => Some(self.listen_addr.clone()),
            _ => None,
        }
    }
}

impl MiningConfig {
    pub fn miner_config(&self, mining_address: String) -> MinerConfig {
        MinerConfig {
            mining_address,
            max_block_transactions: self.max_block_transactions,
            tip_check_interval: self.tip_check_interval,
            max_nonces_per_round: self.max_nonces_per_round,
        }
    }
}
