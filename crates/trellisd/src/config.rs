//! Configuration for trellisd

use crate::node::NodeConfig;
use crate::node_table::RoutePolicy;
use crate::tun::TunMode;
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use trellis_net::{KeyPair, SessionConfig};

/// trellisd - Trellis mesh node
#[derive(Parser, Debug, Clone)]
#[command(name = "trellisd")]
#[command(about = "Trellis encrypted IPv6 mesh node")]
pub struct Config {
    /// UDP listen address
    #[arg(short, long, default_value = "0.0.0.0:7000")]
    pub listen: SocketAddr,

    /// Peers to beacon (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Broadcast address to beacon as well
    #[arg(long)]
    pub broadcast: Option<SocketAddr>,

    /// Identity file, created on first run
    #[arg(short, long, env = "TRELLIS_IDENTITY", default_value = "./data/trellisd/identity.json")]
    pub identity_file: PathBuf,

    /// Beacon interval in milliseconds
    #[arg(long, default_value = "2000")]
    pub beacon_interval_ms: u64,

    /// Announcement interval in milliseconds
    #[arg(long, default_value = "10000")]
    pub announce_interval_ms: u64,

    /// Handshake timeout in milliseconds
    #[arg(long, default_value = "5000")]
    pub handshake_timeout_ms: u64,

    /// Session idle timeout in seconds
    #[arg(long, default_value = "120")]
    pub session_timeout_secs: u64,

    /// Node table entry lifetime in seconds
    #[arg(long, default_value = "300")]
    pub node_ttl_secs: u64,

    /// Payloads queued per peer while a handshake runs
    #[arg(long, default_value = "16")]
    pub max_queued: usize,

    /// Protocols accepted from the device
    #[arg(long, value_enum, default_value = "ip6-only")]
    pub tun_mode: TunMode,

    /// Route preference between direct and announced sightings
    #[arg(long, value_enum, default_value = "prefer-direct")]
    pub route_policy: RoutePolicy,

    /// Timer resolution in milliseconds
    #[arg(long, default_value = "100")]
    pub tick_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.beacon_interval_ms == 0 {
            anyhow::bail!("Beacon interval must be positive");
        }
        if self.tick_ms == 0 || self.tick_ms > self.beacon_interval_ms {
            anyhow::bail!("Tick must be between 1 ms and the beacon interval");
        }
        if self.handshake_timeout_ms >= self.session_timeout_secs.saturating_mul(1000) {
            anyhow::bail!("Handshake timeout must be shorter than the session timeout");
        }
        if self.max_queued == 0 {
            anyhow::bail!("Queue length must be at least 1");
        }
        if self.peers.contains(&self.listen) {
            anyhow::bail!("Peer list contains our own listen address {}", self.listen);
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        Ok(())
    }

    /// Settings for the node itself
    pub fn node_config(&self) -> NodeConfig {
        let session_timeout_ms = self.session_timeout_secs.saturating_mul(1000);
        NodeConfig {
            beacon_interval_ms: self.beacon_interval_ms,
            announce_interval_ms: self.announce_interval_ms,
            node_ttl_ms: self.node_ttl_secs.saturating_mul(1000),
            tun_mode: self.tun_mode,
            route_policy: self.route_policy,
            session: SessionConfig {
                max_queued: self.max_queued,
                handshake_timeout_ms: self.handshake_timeout_ms,
                session_timeout_ms,
                keepalive_interval_ms: session_timeout_ms / 3,
                ..SessionConfig::default()
            },
            peers: self.peers.clone(),
            broadcast: self.broadcast,
            ..NodeConfig::default()
        }
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Identity keypair seed
    pub keypair_seed: [u8; 32],
}

impl NodeState {
    /// Fresh identity with a mesh address
    pub fn generate() -> Self {
        Self {
            keypair_seed: KeyPair::generate_mesh().seed(),
        }
    }

    pub fn keypair(&self) -> KeyPair {
        KeyPair::from_seed(&self.keypair_seed)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing identity file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing identity file {}", path.display()))
    }

    /// Load the identity at `path`, creating it on first run
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let state = Self::generate();
        state.save(path)?;
        info!("Created new identity at {}", path.display());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("trellisd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.listen, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.tun_mode, TunMode::Ip6Only);

        let node = config.node_config();
        assert_eq!(node.session.session_timeout_ms, 120_000);
        assert_eq!(node.node_ttl_ms, 300_000);
        assert!(node.peers.is_empty());
    }

    #[test]
    fn test_peer_list_and_enums() {
        let config = parse(&[
            "--peers",
            "10.0.0.2:7000,10.0.0.3:7000",
            "--tun-mode",
            "dual",
            "--route-policy",
            "fewest-hops",
        ]);
        assert_eq!(config.peers.len(), 2);
        let node = config.node_config();
        assert_eq!(node.tun_mode, TunMode::Dual);
        assert_eq!(node.route_policy, RoutePolicy::FewestHops);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = parse(&[]);
        config.tick_ms = 0;
        assert!(config.validate().is_err());

        let mut config = parse(&["--listen", "10.0.0.1:7000", "--peers", "10.0.0.1:7000"]);
        assert!(config.validate().is_err());
        config.peers.clear();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let first = NodeState::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(first.keypair().node_key().has_mesh_address());

        let second = NodeState::load_or_create(&path).unwrap();
        assert_eq!(first.keypair_seed, second.keypair_seed);
    }

    #[test]
    fn test_corrupt_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(NodeState::load_or_create(&path).is_err());
    }
}
