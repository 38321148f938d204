//! TonMesh DHT Node
//!
//! Joins the DHT through the configured bootstrap nodes, answers queries,
//! stores values and keeps its own address record published.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tonmesh_adnl::{Address, LocalNode, UdpTransportBuilder};
use tonmesh_crypto::PrivateKey;
use tonmesh_dht::Dht;

use config::NodeConfig;

/// TonMesh DHT Node
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file path, created with defaults if missing
    #[arg(short, long, default_value = "tonmesh-dht.toml")]
    config: PathBuf,

    /// Override the UDP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load_or_create(&args.config).await?;
    if let Some(listen) = args.listen {
        config.network.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&config.logging.level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    config.validate()?;

    info!("Starting TonMesh DHT node...");
    info!("Config: {}", args.config.display());

    let key = load_or_generate_key(&config.identity.key_file)?;
    info!("Node ID: {}", key.short_id());
    info!("Public key: {}", BASE64.encode(key.public_key().as_bytes()));

    // Transport
    let listen = config.listen_addr()?;
    let transport = Arc::new(
        UdpTransportBuilder::new(listen)
            .recv_buffer_size(config.network.recv_buffer_size)
            .send_buffer_size(config.network.send_buffer_size)
            .build()
            .context("Failed to bind UDP socket")?,
    );
    let advertised = config.public_addr()?.unwrap_or_else(|| transport.local_addr());
    info!("Listening on {}, advertising {}", transport.local_addr(), advertised);

    let (tx, rx) = mpsc::channel(config.network.queue_size);
    let mut receiver = transport.clone().spawn_receiver(tx);

    // ADNL and DHT
    let adnl = LocalNode::new(
        key,
        transport,
        vec![Address::from(advertised)],
        config.adnl_config(),
    )?;
    adnl.start(rx);

    let dht = Dht::new(adnl, config.dht_config())?;

    for node in &config.bootstrap.nodes {
        let (public_key, addr_list) = node.parse()?;
        if !dht.add_bootstrap_node(public_key, addr_list).await {
            warn!("Bootstrap node {} not added", node.address);
        }
    }

    let known = dht.bootstrap().await;
    info!("Bootstrap complete, {} nodes known", known);

    match dht.publish_address().await {
        Ok(stored) => info!("Address published to {} nodes", stored),
        Err(e) => warn!("Failed to publish address: {}", e),
    }

    let maintenance = dht.start_maintenance();

    let mut publish = tokio::time::interval(Duration::from_secs(config.intervals.publish_secs));
    let mut stats = tokio::time::interval(Duration::from_secs(config.intervals.stats_secs));
    publish.tick().await;
    stats.tick().await;

    loop {
        tokio::select! {
            _ = publish.tick() => {
                if let Err(e) = dht.publish_address().await {
                    warn!("Failed to publish address: {}", e);
                }
            }
            _ = stats.tick() => {
                let s = dht.stats().await;
                info!(
                    "Stats: {} DHT nodes, {} values, {} reverse clients, {} connections",
                    s.nodes, s.values, s.reverse_clients, s.connections
                );
            }
            _ = &mut receiver => {
                error!("UDP receiver stopped");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    maintenance.abort();
    Ok(())
}

fn parse_level(level: &str) -> Level {
    match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Key file format: raw 32-byte Ed25519 secret
fn load_or_generate_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid key file {}", path.display()))?;
        Ok(PrivateKey::from_bytes(bytes))
    } else {
        let key = PrivateKey::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_key_file(path, &key.to_bytes())
            .with_context(|| format!("Failed to write key file {}", path.display()))?;
        info!("Generated new key and saved to {}", path.display());
        Ok(key)
    }
}

/// Owner-only on unix
#[cfg(unix)]
fn write_key_file(path: &Path, secret: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, secret: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("tonmesh-key-{}", PrivateKey::generate().short_id().to_hex()));
        let path = dir.join("node.key");
        let created = load_or_generate_key(&path).unwrap();
        let loaded = load_or_generate_key(&path).unwrap();
        assert_eq!(created.short_id(), loaded.short_id());

        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(load_or_generate_key(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("tonmesh-key-{}", PrivateKey::generate().short_id().to_hex()));
        let path = dir.join("node.key");
        load_or_generate_key(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
