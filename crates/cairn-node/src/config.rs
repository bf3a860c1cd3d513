//! Node configuration

use cairn_core::erasure::ErasureConfig;
use cairn_mesh::retry::RetryPolicy;
use cairn_mesh::MeshConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Block storage configuration
    pub storage: StorageConfig,

    /// Peer mesh configuration
    pub network: NetworkConfig,

    /// Encryption configuration
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum plaintext bytes per block
    pub chunk_size: usize,
    /// Erasure code new uploads when set
    pub erasure: Option<ErasureConfig>,
    /// SQLite database file name inside the data directory
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Our identifier at the signaling service
    pub peer_id: String,
    /// Peers to connect to on startup
    pub bootstrap_peers: Vec<String>,
    /// Connection attempt timeout in seconds
    pub connect_timeout_secs: u64,
    /// First retry delay in seconds
    pub retry_base_delay_secs: u64,
    /// Retry delay cap in seconds
    pub retry_max_delay_secs: u64,
    /// Total connection attempts before a peer is unreachable
    pub max_connect_attempts: u32,
    /// Upper bound of the random gossip connect delay in milliseconds
    pub gossip_jitter_ms: u64,
    /// Block request timeout in seconds
    pub request_timeout_secs: u64,
    /// Quality sampling interval in seconds
    pub quality_interval_secs: u64,
    /// Ping timeout in milliseconds
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Add the ML-KEM / ML-DSA layer on top of the symmetric layer
    pub post_quantum: bool,
    /// Keyring file name inside the data directory
    pub keyring_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.cairn".to_string(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            crypto: CryptoConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: cairn_core::CHUNK_SIZE,
            erasure: None,
            database: "cairn.db".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            bootstrap_peers: vec![],
            connect_timeout_secs: 30,
            retry_base_delay_secs: 5,
            retry_max_delay_secs: 30,
            max_connect_attempts: 3,
            gossip_jitter_ms: 2000,
            request_timeout_secs: 5,
            quality_interval_secs: 5,
            ping_timeout_ms: 3000,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            post_quantum: false,
            keyring_file: "keyring.json".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn mesh(&self) -> MeshConfig {
        MeshConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_secs(self.retry_base_delay_secs),
                max_delay: Duration::from_secs(self.retry_max_delay_secs),
                multiplier: 2,
                max_attempts: self.max_connect_attempts.max(1),
            },
            gossip_jitter: Duration::from_millis(self.gossip_jitter_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            quality_interval: Duration::from_secs(self.quality_interval_secs.max(1)),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> std::path::PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn database_path(&self) -> std::path::PathBuf {
        self.data_dir().join(&self.storage.database)
    }

    pub fn keyring_path(&self) -> std::path::PathBuf {
        self.data_dir().join(&self.crypto.keyring_file)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
