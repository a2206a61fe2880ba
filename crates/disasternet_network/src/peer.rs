//! Peer registry: tracking known peers, their addresses and connection state.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::PeerId;

/// A dialable network address of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerAddr {
    /// Length-prefixed frames over plain TCP.
    Tcp(SocketAddr),
    /// Binary WebSocket messages.
    Ws(SocketAddr),
}

impl PeerAddr {
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(addr) | Self::Ws(addr) => *addr,
        }
    }

    /// Same transport, different socket address.
    pub fn with_socket_addr(&self, addr: SocketAddr) -> Self {
        match self {
            Self::Tcp(_) => Self::Tcp(addr),
            Self::Ws(_) => Self::Ws(addr),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Ws(addr) => write!(f, "ws://{addr}"),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = String;

    /// Accepts `tcp://ip:port`, `ws://ip:port`, or a bare `ip:port` (TCP).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ctor, rest): (fn(SocketAddr) -> PeerAddr, &str) =
            if let Some(rest) = s.strip_prefix("tcp://") {
                (PeerAddr::Tcp, rest)
            } else if let Some(rest) = s.strip_prefix("ws://") {
                (PeerAddr::Ws, rest)
            } else {
                (PeerAddr::Tcp, s)
            };
        let addr: SocketAddr = rest
            .parse()
            .map_err(|e| format!("invalid peer address '{s}': {e}"))?;
        Ok(ctor(addr))
    }
}

impl Serialize for PeerAddr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Found via discovery; a dial has been requested.
    Discovered,
    /// Dial and handshake in progress.
    Connecting,
    /// Secure, multiplexed connection established.
    Connected,
    /// Was connected but the connection closed.
    Disconnected,
    /// Every known address failed the last dial.
    Unreachable,
}

/// Information about a known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's unique identifier.
    pub id: PeerId,
    /// Addresses to try when dialing, in preference order.
    pub known_addresses: Vec<PeerAddr>,
    /// Current connection state.
    pub state: PeerState,
    /// When the peer was last connected (if ever).
    pub connected_at: Option<DateTime<Utc>>,
    /// Last time we heard from this peer.
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(id: PeerId, known_addresses: Vec<PeerAddr>) -> Self {
        let mut record = Self {
            id,
            known_addresses: Vec::new(),
            state: PeerState::Discovered,
            connected_at: None,
            last_seen: Utc::now(),
        };
        record.merge_addresses(&known_addresses);
        record
    }

    /// Add addresses not yet known. Returns true if anything was added.
    pub fn merge_addresses(&mut self, addrs: &[PeerAddr]) -> bool {
        let mut changed = false;
        for addr in addrs {
            if !self.known_addresses.contains(addr) {
                self.known_addresses.push(*addr);
                changed = true;
            }
        }
        changed
    }
}

/// Registry of all known peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery announcement.
    ///
    /// Returns the record to dial if this is a newly-seen transition: the peer
    /// was unknown, its last connection closed, or it was unreachable and now
    /// announces an address we did not have. Peers that are already
    /// discovered, connecting or connected never produce a second event.
    pub fn observe_announcement(&mut self, id: PeerId, addrs: &[PeerAddr]) -> Option<PeerRecord> {
        match self.peers.get_mut(&id) {
            None => {
                let record = PeerRecord::new(id, addrs.to_vec());
                self.peers.insert(id, record.clone());
                Some(record)
            }
            Some(record) => {
                record.last_seen = Utc::now();
                let new_addrs = record.merge_addresses(addrs);
                let emit = match record.state {
                    PeerState::Disconnected => true,
                    PeerState::Unreachable => new_addrs,
                    PeerState::Discovered | PeerState::Connecting | PeerState::Connected => false,
                };
                if emit {
                    record.state = PeerState::Discovered;
                    Some(record.clone())
                } else {
                    None
                }
            }
        }
    }

    /// Add or update a peer, merging addresses.
    pub fn upsert(&mut self, id: PeerId, addrs: &[PeerAddr]) -> &mut PeerRecord {
        let record = self
            .peers
            .entry(id)
            .or_insert_with(|| PeerRecord::new(id, Vec::new()));
        record.merge_addresses(addrs);
        record.last_seen = Utc::now();
        record
    }

    /// Remove a peer by ID.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// List all peers that are currently connected.
    pub fn list_connected(&self) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .collect()
    }

    /// List all known peers regardless of state.
    pub fn list_all(&self) -> Vec<&PeerRecord> {
        self.peers.values().collect()
    }

    /// Return the number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Return the total number of known peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    /// Update the state of a peer.
    pub fn update_state(&mut self, peer_id: &PeerId, state: PeerState) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if state == PeerState::Connected && peer.state != PeerState::Connected {
                peer.connected_at = Some(Utc::now());
            }
            peer.state = state;
        }
    }

    /// Update the last-seen timestamp for a peer.
    pub fn update_last_seen(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Utc::now();
        }
    }

    /// Mark every connected or connecting peer as disconnected.
    pub fn disconnect_all(&mut self) {
        for peer in self.peers.values_mut() {
            if matches!(peer.state, PeerState::Connected | PeerState::Connecting) {
                peer.state = PeerState::Disconnected;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
