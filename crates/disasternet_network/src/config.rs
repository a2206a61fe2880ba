//! Network configuration for a mesh node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL};
use crate::discovery::{DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_TAG};
use crate::peer::PeerAddr;
use crate::router::{DEFAULT_QUEUE_CAPACITY, RouterConfig};
use crate::secure::DEFAULT_HANDSHAKE_TIMEOUT;

/// Default TCP listen port; WebSocket listens on the next port up.
pub const DEFAULT_PORT: u16 = 9000;

/// Configuration for the networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Addresses to accept connections on.
    pub listen_addrs: Vec<PeerAddr>,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    pub discovery_enabled: bool,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    /// Destination IP for announcements, sent to `discovery_port`.
    pub broadcast_ip: IpAddr,

    /// Only peers announcing the same tag are discovered.
    pub service_tag: String,

    /// Interval between discovery announcements.
    #[serde(with = "duration_serde")]
    pub announce_interval: Duration,

    /// Timeout for connecting plus the secure handshake.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Depth of each per-connection outbound queue.
    pub outbound_queue_capacity: usize,

    /// Number of message ids remembered for duplicate suppression.
    pub seen_cache_capacity: usize,

    /// How long a message id is remembered.
    #[serde(with = "duration_serde")]
    pub seen_cache_ttl: Duration,

    /// Bootstrap peer addresses to connect to on startup.
    pub known_peers: Vec<PeerAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Self::listen_addrs_for_port(DEFAULT_PORT),
            discovery_enabled: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            service_tag: DEFAULT_SERVICE_TAG.to_string(),
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            seen_cache_capacity: DEFAULT_SEEN_CAPACITY,
            seen_cache_ttl: DEFAULT_SEEN_TTL,
            known_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// TCP on `port` and WebSocket on `port + 1`, all interfaces.
    pub fn listen_addrs_for_port(port: u16) -> Vec<PeerAddr> {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        vec![
            PeerAddr::Tcp(SocketAddr::new(any, port)),
            PeerAddr::Ws(SocketAddr::new(any, port.wrapping_add(1))),
        ]
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_ip, self.discovery_port)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            queue_capacity: self.outbound_queue_capacity,
            seen_capacity: self.seen_cache_capacity,
            seen_ttl: self.seen_cache_ttl,
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Durations as whole milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(
            config.listen_addrs,
            vec![
                "tcp://0.0.0.0:9000".parse::<PeerAddr>().unwrap(),
                "ws://0.0.0.0:9001".parse::<PeerAddr>().unwrap(),
            ]
        );
        assert!(config.discovery_enabled);
        assert_eq!(config.discovery_port, 9471);
        assert_eq!(config.broadcast_addr().to_string(), "255.255.255.255:9471");
        assert_eq!(config.service_tag, "disasternet-mdns");
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.outbound_queue_capacity, 1024);
        assert_eq!(config.seen_cache_ttl, Duration::from_secs(120));
        assert!(config.known_peers.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"discovery_port": 5000, "known_peers": ["ws://10.0.0.2:9001"]}"#)
                .unwrap();
        assert_eq!(config.discovery_port, 5000);
        assert_eq!(config.broadcast_addr().port(), 5000);
        assert_eq!(config.known_peers.len(), 1);
        assert_eq!(config.service_tag, DEFAULT_SERVICE_TAG);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut saved = NetworkConfig::default();
        saved.seen_cache_capacity = 64;
        saved.announce_interval = Duration::from_millis(250);
        saved.known_peers = vec!["192.168.1.100:9000".parse().unwrap()];
        saved.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.seen_cache_capacity, 64);
        assert_eq!(loaded.announce_interval, Duration::from_millis(250));
        assert_eq!(loaded.known_peers, saved.known_peers);
    }

    #[test]
    fn test_config_load_missing_or_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(NetworkConfig::load_or_default(&missing).discovery_port, 9471);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(NetworkConfig::load_or_default(&corrupt).discovery_port, 9471);
    }
}
