//! LAN peer discovery via UDP broadcast.
//!
//! The [`DiscoveryService`] periodically broadcasts an announcement packet
//! on the local network and listens for announcements from other peers
//! sharing its service tag. Accepted announcements update the peer registry;
//! a [`PeerDiscovered`] event is sent only when the registry says the peer
//! is newly worth dialing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::peer::{PeerAddr, PeerRecord, PeerRegistry};

/// Default UDP port for announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9471;

/// Default service tag; peers with a different tag are ignored.
pub const DEFAULT_SERVICE_TAG: &str = "disasternet-mdns";

/// Default time between announcements.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

const MAX_PACKET_LEN: usize = 8 * 1024;

/// An announcement broadcast by a peer on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// The peer's unique ID.
    pub peer_id: PeerId,
    /// Discovery namespace.
    pub service_tag: String,
    /// Addresses the peer accepts connections on.
    pub addresses: Vec<PeerAddr>,
}

/// Event emitted when a peer should be dialed.
#[derive(Debug, Clone)]
pub struct PeerDiscovered {
    /// Registry record after the announcement was merged.
    pub record: PeerRecord,
    /// The source address of the UDP packet.
    pub source_addr: SocketAddr,
}

/// Lifecycle of the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryState {
    Idle = 0,
    Announcing = 1,
    Listening = 2,
    Stopped = 3,
}

impl DiscoveryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Announcing,
            2 => Self::Listening,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where to listen for announcements.
    pub listen_addr: SocketAddr,
    /// Where announcements are sent.
    pub broadcast_addr: SocketAddr,
    /// How often to broadcast an announcement.
    pub interval: Duration,
    /// Our own announcement to broadcast.
    pub announcement: Announcement,
}

impl DiscoveryConfig {
    /// Listen on every interface and broadcast to the limited broadcast
    /// address, both on `port`.
    pub fn new(port: u16, announcement: Announcement) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            broadcast_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            interval: DEFAULT_ANNOUNCE_INTERVAL,
            announcement,
        }
    }
}

/// Validate a received packet.
///
/// Returns `None` for undecodable packets, our own announcements and other
/// service tags. Unspecified IPs in the announced addresses are replaced by
/// the packet's source IP.
pub fn accept_announcement(
    local: &PeerId,
    service_tag: &str,
    packet: &[u8],
    source: SocketAddr,
) -> Option<Announcement> {
    let mut announcement = match serde_json::from_slice::<Announcement>(packet) {
        Ok(a) => a,
        Err(e) => {
            trace!("Ignoring undecodable discovery packet from {source}: {e}");
            return None;
        }
    };
    if announcement.peer_id == *local || announcement.service_tag != service_tag {
        return None;
    }
    for addr in &mut announcement.addresses {
        if addr.socket_addr().ip().is_unspecified() {
            *addr = addr.with_socket_addr(SocketAddr::new(source.ip(), addr.socket_addr().port()));
        }
    }
    Some(announcement)
}

/// Handle to a running discovery service.
pub struct DiscoveryHandle {
    local_addr: SocketAddr,
    state: Arc<AtomicU8>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// Address the listener socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> DiscoveryState {
        DiscoveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stop both tasks and release their sockets.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.state
            .store(DiscoveryState::Stopped as u8, Ordering::Release);
        info!("Discovery stopped");
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind a UDP socket that other processes on this host may bind as well,
/// so several nodes can listen on the same discovery port.
fn bind_shared(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// LAN discovery service using UDP broadcast.
pub struct DiscoveryService;

impl DiscoveryService {
    /// Start the discovery service in the background.
    ///
    /// Spawns two tasks:
    /// 1. A broadcaster that sends our announcement at the configured interval.
    /// 2. A listener that merges announcements into `registry` and reports
    ///    peers worth dialing through `discovered_tx`.
    pub async fn start(
        config: DiscoveryConfig,
        registry: Arc<RwLock<PeerRegistry>>,
        discovered_tx: mpsc::Sender<PeerDiscovered>,
    ) -> Result<DiscoveryHandle, NetworkError> {
        let listener_socket = bind_shared(config.listen_addr)
            .map_err(|e| NetworkError::Discovery(format!("Bind failed: {e}")))?;
        let local_addr = listener_socket.local_addr()?;
        info!("Discovery service listening on {local_addr}");

        // Bind a separate socket for sending broadcasts.
        let sender_bind = SocketAddr::new(
            if config.broadcast_addr.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
            },
            0,
        );
        let sender_socket = UdpSocket::bind(sender_bind)
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        sender_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;

        let announcement_bytes = serde_json::to_vec(&config.announcement)?;
        let state = Arc::new(AtomicU8::new(DiscoveryState::Listening as u8));
        let (shutdown, _) = broadcast::channel(1);

        let broadcaster = {
            let state = Arc::clone(&state);
            let mut shutdown = shutdown.subscribe();
            let target = config.broadcast_addr;
            let mut ticker = tokio::time::interval(config.interval);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            state.store(DiscoveryState::Announcing as u8, Ordering::Release);
                            match sender_socket.send_to(&announcement_bytes, target).await {
                                Ok(_) => trace!("Broadcast announcement sent"),
                                Err(e) => debug!("Broadcast send failed: {e}"),
                            }
                            state.store(DiscoveryState::Listening as u8, Ordering::Release);
                        }
                        _ = shutdown.recv() => {
                            debug!("Discovery broadcaster shutting down");
                            break;
                        }
                    }
                }
            })
        };

        let listener = {
            let mut shutdown = shutdown.subscribe();
            let local = config.announcement.peer_id;
            let tag = config.announcement.service_tag.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_PACKET_LEN];
                loop {
                    tokio::select! {
                        result = listener_socket.recv_from(&mut buf) => {
                            match result {
                                Ok((len, src_addr)) => {
                                    let Some(announcement) =
                                        accept_announcement(&local, &tag, &buf[..len], src_addr)
                                    else {
                                        continue;
                                    };
                                    let record = registry
                                        .write()
                                        .await
                                        .observe_announcement(announcement.peer_id, &announcement.addresses);
                                    if let Some(record) = record {
                                        debug!("Discovered peer {} at {src_addr}", record.id.short());
                                        let _ = discovered_tx
                                            .send(PeerDiscovered {
                                                record,
                                                source_addr: src_addr,
                                            })
                                            .await;
                                    }
                                }
                                Err(e) => {
                                    warn!("Discovery recv error: {e}");
                                }
                            }
                        }
                        _ = shutdown.recv() => {
                            debug!("Discovery listener shutting down");
                            break;
                        }
                    }
                }
            })
        };

        Ok(DiscoveryHandle {
            local_addr,
            state,
            shutdown,
            tasks: vec![broadcaster, listener],
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::peer::PeerState;

    fn announcement(peer_id: PeerId, tag: &str, addr: &str) -> Announcement {
        Announcement {
            peer_id,
            service_tag: tag.to_string(),
            addresses: vec![addr.parse().unwrap()],
        }
    }

    fn source() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[test]
    fn test_accepts_matching_tag_and_rewrites_unspecified() {
        let local = *NodeIdentity::generate().peer_id();
        let remote = *NodeIdentity::generate().peer_id();
        let packet =
            serde_json::to_vec(&announcement(remote, "tag", "tcp://0.0.0.0:9000")).unwrap();

        let accepted = accept_announcement(&local, "tag", &packet, source()).unwrap();
        assert_eq!(accepted.peer_id, remote);
        assert_eq!(
            accepted.addresses,
            vec!["tcp://192.168.1.20:9000".parse::<PeerAddr>().unwrap()]
        );
    }

    #[test]
    fn test_filters_foreign_self_and_garbage() {
        let local = *NodeIdentity::generate().peer_id();
        let remote = *NodeIdentity::generate().peer_id();

        let foreign = serde_json::to_vec(&announcement(remote, "other", "tcp://10.0.0.1:1")).unwrap();
        assert!(accept_announcement(&local, "tag", &foreign, source()).is_none());

        let own = serde_json::to_vec(&announcement(local, "tag", "tcp://10.0.0.1:1")).unwrap();
        assert!(accept_announcement(&local, "tag", &own, source()).is_none());

        assert!(accept_announcement(&local, "tag", b"\xff\x00garbage", source()).is_none());
    }

    #[tokio::test]
    async fn test_announcements_emit_once() {
        let listener_id = *NodeIdentity::generate().peer_id();
        let announcer_id = *NodeIdentity::generate().peer_id();

        // Listening side: announces nowhere useful.
        let mut listen_cfg = DiscoveryConfig::new(
            0,
            announcement(listener_id, "tag", "tcp://127.0.0.1:1"),
        );
        listen_cfg.listen_addr = "127.0.0.1:0".parse().unwrap();
        listen_cfg.broadcast_addr = "127.0.0.1:9".parse().unwrap();
        let registry = Arc::new(RwLock::new(PeerRegistry::new()));
        let (tx, mut rx) = mpsc::channel(16);
        let mut listening = DiscoveryService::start(listen_cfg, Arc::clone(&registry), tx)
            .await
            .unwrap();

        // Announcing side: sends straight at the listener, quickly.
        let mut announce_cfg = DiscoveryConfig::new(
            0,
            announcement(announcer_id, "tag", "tcp://0.0.0.0:9000"),
        );
        announce_cfg.listen_addr = "127.0.0.1:0".parse().unwrap();
        announce_cfg.broadcast_addr = listening.local_addr();
        announce_cfg.interval = Duration::from_millis(20);
        let (other_tx, _other_rx) = mpsc::channel(16);
        let mut announcing = DiscoveryService::start(
            announce_cfg,
            Arc::new(RwLock::new(PeerRegistry::new())),
            other_tx,
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.record.id, announcer_id);
        assert_eq!(
            event.record.known_addresses,
            vec!["tcp://127.0.0.1:9000".parse::<PeerAddr>().unwrap()]
        );

        // Several more announcements arrive; none re-emit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        // Once the peer is marked disconnected, the next announcement emits.
        registry
            .write()
            .await
            .update_state(&announcer_id, PeerState::Disconnected);
        let again = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.record.id, announcer_id);

        announcing.stop().await;
        listening.stop().await;
        assert_eq!(listening.state(), DiscoveryState::Stopped);
    }

    #[tokio::test]
    async fn test_services_share_one_port() {
        let (tx, _rx) = mpsc::channel(4);
        let mut first_cfg = DiscoveryConfig::new(
            0,
            announcement(*NodeIdentity::generate().peer_id(), "tag", "tcp://127.0.0.1:1"),
        );
        first_cfg.listen_addr = "127.0.0.1:0".parse().unwrap();
        first_cfg.broadcast_addr = "127.0.0.1:9".parse().unwrap();
        let mut first =
            DiscoveryService::start(first_cfg, Arc::new(RwLock::new(PeerRegistry::new())), tx.clone())
                .await
                .unwrap();

        let mut second_cfg = DiscoveryConfig::new(
            0,
            announcement(*NodeIdentity::generate().peer_id(), "tag", "tcp://127.0.0.1:2"),
        );
        second_cfg.listen_addr = first.local_addr();
        second_cfg.broadcast_addr = "127.0.0.1:9".parse().unwrap();
        let mut second =
            DiscoveryService::start(second_cfg, Arc::new(RwLock::new(PeerRegistry::new())), tx)
                .await
                .unwrap();
        assert_eq!(second.local_addr(), first.local_addr());

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_socket() {
        let id = *NodeIdentity::generate().peer_id();
        let mut config = DiscoveryConfig::new(0, announcement(id, "tag", "tcp://127.0.0.1:1"));
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.broadcast_addr = "127.0.0.1:9".parse().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let mut handle = DiscoveryService::start(config, Arc::new(RwLock::new(PeerRegistry::new())), tx)
            .await
            .unwrap();
        assert_ne!(handle.state(), DiscoveryState::Stopped);

        let bound = handle.local_addr();
        handle.stop().await;
        UdpSocket::bind(bound).await.unwrap();
    }
}
