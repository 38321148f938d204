//! Node configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tonmesh_adnl::{AddressList, AdnlConfig};
use tonmesh_crypto::PublicKey;
use tonmesh_dht::DhtConfig;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Identity configuration
    pub identity: IdentityConfig,
    /// DHT parameters
    pub dht: DhtSection,
    /// Periodic tasks
    pub intervals: IntervalConfig,
    /// Bootstrap nodes
    pub bootstrap: BootstrapConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP listen address
    pub listen: String,
    /// Address advertised to peers, if different from `listen`
    pub public_address: Option<String>,
    /// Socket receive buffer size in bytes
    pub recv_buffer_size: usize,
    /// Socket send buffer size in bytes
    pub send_buffer_size: usize,
    /// Inbound datagram queue length
    pub queue_size: usize,
    /// Maximum cached ADNL connections
    pub max_connections: usize,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// File holding the 32-byte private key; created if missing
    pub key_file: PathBuf,
}

/// DHT parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtSection {
    pub k: usize,
    pub a: usize,
    pub query_timeout_ms: u64,
    pub query_jitter_ms: u64,
    pub ping_ttl_secs: u64,
    pub max_values: usize,
    pub address_ttl_secs: u64,
}

/// Periodic tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Seconds between address publications
    pub publish_secs: u64,
    /// Seconds between statistics log lines
    pub stats_secs: u64,
    /// Seconds between maintenance passes
    pub maintenance_secs: u64,
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub nodes: Vec<BootstrapNode>,
}

/// A known DHT node to join through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapNode {
    /// Base64 Ed25519 public key
    pub public_key: String,
    /// UDP address
    pub address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            network: NetworkConfig {
                listen: "0.0.0.0:30310".to_string(),
                public_address: None,
                recv_buffer_size: 4 * 1024 * 1024,
                send_buffer_size: 4 * 1024 * 1024,
                queue_size: 4096,
                max_connections: AdnlConfig::default().max_connections,
            },
            identity: IdentityConfig {
                key_file: PathBuf::from("tonmesh-dht.key"),
            },
            dht: DhtSection {
                k: dht.k,
                a: dht.a,
                query_timeout_ms: dht.query_timeout.as_millis() as u64,
                query_jitter_ms: dht.query_jitter.as_millis() as u64,
                ping_ttl_secs: dht.ping_ttl.as_secs(),
                max_values: dht.max_values,
                address_ttl_secs: dht.address_ttl.as_secs(),
            },
            intervals: IntervalConfig {
                publish_secs: 600,
                stats_secs: 60,
                maintenance_secs: dht.maintenance_interval.as_secs(),
            },
            bootstrap: BootstrapConfig { nodes: vec![] },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl BootstrapNode {
    /// Public key and address list of this node
    pub fn parse(&self) -> Result<(PublicKey, AddressList)> {
        let raw = BASE64
            .decode(self.public_key.trim())
            .with_context(|| format!("Bootstrap key {} is not base64", self.public_key))?;
        let key = PublicKey::try_from_slice(&raw)
            .with_context(|| format!("Bootstrap key {} is not an Ed25519 key", self.public_key))?;
        let addr: SocketAddr = self
            .address
            .parse()
            .with_context(|| format!("Invalid bootstrap address {}", self.address))?;
        Ok((key, AddressList::single(addr)))
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.public_addr()?;
        if self.network.queue_size == 0 {
            anyhow::bail!("queue_size must be > 0");
        }
        if self.intervals.publish_secs == 0
            || self.intervals.stats_secs == 0
            || self.intervals.maintenance_secs == 0
        {
            anyhow::bail!("intervals must be > 0");
        }
        for node in &self.bootstrap.nodes {
            node.parse()?;
        }
        self.adnl_config().validate()?;
        self.dht_config().validate()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.network
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.network.listen))
    }

    /// Advertised address, if configured
    pub fn public_addr(&self) -> Result<Option<SocketAddr>> {
        self.network
            .public_address
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("Invalid public address {}", addr))
            })
            .transpose()
    }

    pub fn adnl_config(&self) -> AdnlConfig {
        AdnlConfig {
            max_connections: self.network.max_connections,
            ..Default::default()
        }
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.dht.k,
            a: self.dht.a,
            query_timeout: Duration::from_millis(self.dht.query_timeout_ms),
            query_jitter: Duration::from_millis(self.dht.query_jitter_ms),
            ping_ttl: Duration::from_secs(self.dht.ping_ttl_secs),
            max_values: self.dht.max_values,
            address_ttl: Duration::from_secs(self.dht.address_ttl_secs),
            maintenance_interval: Duration::from_secs(self.intervals.maintenance_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonmesh_crypto::PrivateKey;

    #[test]
    fn test_default_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dht_config().k, DhtConfig::default().k);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = NodeConfig::default();
        config.bootstrap.nodes.push(BootstrapNode {
            public_key: BASE64.encode(PrivateKey::generate().public_key().as_bytes()),
            address: "10.0.0.1:30310".to_string(),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back: NodeConfig = toml::from_str(&text).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.bootstrap.nodes.len(), 1);
    }

    #[test]
    fn test_bad_bootstrap_node() {
        let mut config = NodeConfig::default();
        config.bootstrap.nodes.push(BootstrapNode {
            public_key: "not base64!".to_string(),
            address: "10.0.0.1:30310".to_string(),
        });
        assert!(config.validate().is_err());

        let node = BootstrapNode {
            public_key: BASE64.encode([1u8; 5]),
            address: "10.0.0.1:30310".to_string(),
        };
        assert!(node.parse().is_err());
    }

    #[test]
    fn test_bad_fanout() {
        let mut config = NodeConfig::default();
        config.dht.a = config.dht.k + 1;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_create() {
        let dir = std::env::temp_dir().join(format!("tonmesh-config-{}", rand_suffix()));
        let path = dir.join("node.toml");
        let created = NodeConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());
        let loaded = NodeConfig::load(&path).await.unwrap();
        assert_eq!(loaded.network.listen, created.network.listen);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    fn rand_suffix() -> String {
        PrivateKey::generate().short_id().to_hex()[..12].to_string()
    }
}
