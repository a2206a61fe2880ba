//! Application settings read from the environment.

use std::path::PathBuf;

use anyhow::{Context, Result};
use disasternet_network::NetworkConfig;
use disasternet_network::PeerAddr;
use disasternet_network::config::DEFAULT_PORT;
use disasternet_network::discovery::{DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_TAG};
use rand::Rng;
use rand::distr::Alphanumeric;

pub const DEFAULT_ROOM: &str = "emergency-room";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_TRANSCRIPT: &str = "logs/messages.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// TCP port; WebSocket listens on `port + 1`.
    pub port: u16,
    pub room: String,
    pub nickname: String,
    pub service_tag: String,
    pub discovery_port: u16,
    /// Bootstrap peers dialed on startup.
    pub peers: Vec<PeerAddr>,
    pub log_dir: PathBuf,
    pub transcript: PathBuf,
    /// Optional JSON [`NetworkConfig`] used as the base for the settings above.
    pub network_file: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(v) => v.trim().parse().with_context(|| format!("Invalid PORT '{v}'"))?,
            None => DEFAULT_PORT,
        };
        let discovery_port = match get("DISCOVERY_PORT") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("Invalid DISCOVERY_PORT '{v}'"))?,
            None => DEFAULT_DISCOVERY_PORT,
        };
        let peers = match get("PEERS") {
            Some(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<PeerAddr>()
                        .map_err(|e| anyhow::anyhow!("Invalid peer address '{s}': {e}"))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            port,
            room: get("ROOM").unwrap_or_else(|| DEFAULT_ROOM.to_string()),
            nickname: get("NICK").unwrap_or_else(random_nickname),
            service_tag: get("SERVICE_TAG").unwrap_or_else(|| DEFAULT_SERVICE_TAG.to_string()),
            discovery_port,
            peers,
            log_dir: get("LOG_DIR").map_or_else(|| PathBuf::from(DEFAULT_LOG_DIR), PathBuf::from),
            transcript: get("TRANSCRIPT")
                .map_or_else(|| PathBuf::from(DEFAULT_TRANSCRIPT), PathBuf::from),
            network_file: get("NETWORK_CONFIG").map(PathBuf::from),
        })
    }

    pub fn network_config(&self) -> NetworkConfig {
        let mut config = match &self.network_file {
            Some(path) => NetworkConfig::load_or_default(path),
            None => NetworkConfig::default(),
        };
        config.listen_addrs = NetworkConfig::listen_addrs_for_port(self.port);
        config.service_tag = self.service_tag.clone();
        config.discovery_port = self.discovery_port;
        for peer in &self.peers {
            if !config.known_peers.contains(peer) {
                config.known_peers.push(*peer);
            }
        }
        config
    }
}

/// `User-` followed by five random uppercase letters or digits.
fn random_nickname() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("User-{suffix}")
}
