//! MeshNode: top-level coordinator for the networking layer.
//!
//! [`MeshNode`] is the primary public API for disasternet_network. It owns:
//! - the transport listeners (TCP and WebSocket)
//! - LAN discovery and the auto-dialer fed by it
//! - the peer registry
//! - the gossip router every connection is attached to
//!
//! Each connection gets one worker task that announces our addresses,
//! hands inbound streams to the router, and cleans up when it closes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::discovery::{
    Announcement, DiscoveryConfig, DiscoveryHandle, DiscoveryService, DiscoveryState,
    PeerDiscovered,
};
use crate::error::{DialError, NetworkError};
use crate::identity::{NodeIdentity, PeerId};
use crate::message::{Identify, STREAM_IDENTIFY};
use crate::mux::MuxStream;
use crate::peer::{PeerAddr, PeerRecord, PeerRegistry, PeerState};
use crate::router::{Detached, GossipRouter};
use crate::transport::{Connection, Transport};

const AGENT: &str = concat!("disasternet/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Auto-dialing
// ---------------------------------------------------------------------------

/// Something that can open a connection to a discovered peer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Whether a live connection to `peer` already exists.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Dial `record` and, on success, start serving the connection.
    async fn dial(&self, record: PeerRecord) -> Result<(), DialError>;
}

/// Turns discovery events into dials, at most one in flight per peer.
pub struct AutoDialer<D> {
    dialer: Arc<D>,
    in_flight: Arc<Mutex<HashSet<PeerId>>>,
}

impl<D> Clone for AutoDialer<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: Arc::clone(&self.dialer),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<D: Dialer> AutoDialer<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self {
            dialer,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a dial for `event` unless one is running or the peer is
    /// already connected.
    pub fn handle(&self, event: PeerDiscovered) -> Option<JoinHandle<()>> {
        let peer = event.record.id;
        if self.dialer.is_connected(&peer) {
            return None;
        }
        if !self.in_flight.lock().insert(peer) {
            return None;
        }
        let dialer = Arc::clone(&self.dialer);
        let in_flight = Arc::clone(&self.in_flight);
        Some(tokio::spawn(async move {
            if let Err(e) = dialer.dial(event.record).await {
                debug!("Auto-dial of {} failed: {e}", peer.short());
            }
            in_flight.lock().remove(&peer);
        }))
    }

    /// Consume discovery events until the channel closes or shutdown.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<PeerDiscovered>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event);
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("Auto-dialer stopped");
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// State shared by the node's background tasks.
struct NodeContext {
    transport: Transport,
    router: GossipRouter,
    peers: Arc<RwLock<PeerRegistry>>,
    listen_addrs: parking_lot::RwLock<Vec<PeerAddr>>,
}

#[async_trait]
impl Dialer for NodeContext {
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.router.is_connected(peer)
    }

    async fn dial(&self, record: PeerRecord) -> Result<(), DialError> {
        self.peers
            .write()
            .await
            .update_state(&record.id, PeerState::Connecting);
        match self.transport.dial(&record).await {
            Ok(conn) => {
                serve_connection(self.shared(), conn);
                Ok(())
            }
            Err(e) => {
                warn!("Could not reach {}: {e}", record.id.short());
                self.peers
                    .write()
                    .await
                    .update_state(&record.id, PeerState::Unreachable);
                Err(e)
            }
        }
    }
}

impl NodeContext {
    fn shared(&self) -> SharedContext {
        SharedContext {
            local: *self.transport.local_peer_id(),
            router: self.router.clone(),
            peers: Arc::clone(&self.peers),
            listen_addrs: self.listen_addrs.read().clone(),
        }
    }
}

/// What a connection worker needs; cheap to move into a task.
#[derive(Clone)]
struct SharedContext {
    local: PeerId,
    router: GossipRouter,
    peers: Arc<RwLock<PeerRegistry>>,
    listen_addrs: Vec<PeerAddr>,
}

/// Spawn the worker for one connection.
fn serve_connection(ctx: SharedContext, conn: Connection) -> JoinHandle<()> {
    tokio::spawn(run_connection(ctx, conn))
}

async fn run_connection(ctx: SharedContext, conn: Connection) {
    let peer = *conn.remote_peer();
    if !ctx.router.attach(&conn) {
        debug!("Dropping redundant connection {} to {}", conn.id(), peer.short());
        conn.close();
        return;
    }
    {
        let mut registry = ctx.peers.write().await;
        registry.upsert(peer, &[]);
        registry.update_state(&peer, PeerState::Connected);
    }
    info!(
        "Connected to {} ({:?}, {})",
        peer.short(),
        conn.direction(),
        conn.remote_addr()
    );

    send_identify(&conn, &ctx).await;

    while let Some(stream) = conn.mux().accept_stream().await {
        let Some(stream) = ctx.router.accept_stream(&conn, stream) else {
            continue;
        };
        if stream.purpose() == STREAM_IDENTIFY {
            tokio::spawn(read_identify(Arc::clone(&ctx.peers), conn.clone(), stream));
        } else {
            debug!("Ignoring stream with unknown purpose {}", stream.purpose());
        }
    }

    let outcome = ctx.router.detach(&peer, conn.id()).await;
    let mut registry = ctx.peers.write().await;
    match outcome {
        Detached::Departed => {
            registry.remove_peer(&peer);
            info!("Peer {} left", peer.short());
        }
        Detached::Closed => {
            registry.update_state(&peer, PeerState::Disconnected);
            info!("Disconnected from {}", peer.short());
        }
        Detached::NotAttached => {}
    }
}

/// Apply activity reports to the registry, one write lock per burst.
async fn track_activity(
    peers: Arc<RwLock<PeerRegistry>>,
    mut activity: mpsc::UnboundedReceiver<PeerId>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let first = tokio::select! {
            peer = activity.recv() => match peer {
                Some(peer) => peer,
                None => break,
            },
            _ = shutdown.recv() => break,
        };
        let mut batch = HashSet::from([first]);
        while let Ok(peer) = activity.try_recv() {
            batch.insert(peer);
        }
        let mut registry = peers.write().await;
        for peer in &batch {
            registry.update_last_seen(peer);
        }
    }
}

async fn send_identify(conn: &Connection, ctx: &SharedContext) {
    let identify = Identify {
        peer_id: ctx.local,
        listen_addrs: ctx.listen_addrs.clone(),
        agent: AGENT.to_string(),
    };
    let bytes = match identify.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode identify: {e}");
            return;
        }
    };
    match conn.mux().open_stream(STREAM_IDENTIFY) {
        Ok(stream) => {
            if let Err(e) = stream.send(&bytes).await {
                debug!("Identify to {} failed: {e}", conn.remote_peer().short());
            }
        }
        Err(e) => debug!("Identify stream to {} failed: {e}", conn.remote_peer().short()),
    }
}

async fn read_identify(peers: Arc<RwLock<PeerRegistry>>, conn: Connection, mut stream: MuxStream) {
    let Some(bytes) = stream.recv().await else {
        return;
    };
    let identify = match Identify::from_bytes(&bytes) {
        Ok(identify) => identify,
        Err(e) => {
            warn!("Bad identify from {}: {e}", conn.remote_peer().short());
            return;
        }
    };
    if identify.peer_id != *conn.remote_peer() {
        warn!(
            "Identify from {} claims to be {}",
            conn.remote_peer().short(),
            identify.peer_id.short()
        );
        return;
    }
    let remote_ip = conn.remote_addr().ip();
    let addrs: Vec<PeerAddr> = identify
        .listen_addrs
        .iter()
        .map(|addr| {
            if addr.socket_addr().ip().is_unspecified() {
                addr.with_socket_addr(std::net::SocketAddr::new(remote_ip, addr.socket_addr().port()))
            } else {
                *addr
            }
        })
        .collect();
    debug!(
        "{} ({}) listens on {} address(es)",
        identify.peer_id.short(),
        identify.agent,
        addrs.len()
    );
    peers.write().await.upsert(identify.peer_id, &addrs);
}

/// The top-level mesh node.
///
/// Create one per application instance. Call [`start()`](MeshNode::start) to
/// begin accepting connections and discovering peers. A stopped node cannot
/// be started again.
pub struct MeshNode {
    /// Our identity on the network.
    identity: Arc<NodeIdentity>,
    /// Network configuration.
    config: NetworkConfig,
    ctx: Arc<NodeContext>,
    discovery: Option<DiscoveryHandle>,
    /// Shutdown signal broadcaster.
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: bool,
    stopped: bool,
}

impl MeshNode {
    /// Create a new node with the given identity and config.
    pub fn new(identity: NodeIdentity, config: NetworkConfig) -> Self {
        let identity = Arc::new(identity);
        let transport =
            Transport::new(Arc::clone(&identity)).with_handshake_timeout(config.handshake_timeout);
        let router = GossipRouter::new(*identity.peer_id(), config.router_config());
        Self {
            ctx: Arc::new(NodeContext {
                transport,
                router,
                peers: Arc::new(RwLock::new(PeerRegistry::new())),
                listen_addrs: parking_lot::RwLock::new(Vec::new()),
            }),
            identity,
            config,
            discovery: None,
            shutdown_tx: None,
            running: false,
            stopped: false,
        }
    }

    /// Create a node with a fresh identity and default config.
    pub fn with_defaults() -> Self {
        Self::new(NodeIdentity::generate(), NetworkConfig::default())
    }

    /// Return the node's peer ID.
    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The gossip router; subscribe and publish through it.
    pub fn router(&self) -> &GossipRouter {
        &self.ctx.router
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Bound listen addresses. Empty until started.
    pub fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.ctx.listen_addrs.read().clone()
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery
            .as_ref()
            .map(DiscoveryHandle::state)
            .unwrap_or(if self.stopped {
                DiscoveryState::Stopped
            } else {
                DiscoveryState::Idle
            })
    }

    /// Get a snapshot of all known peers.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let registry = self.ctx.peers.read().await;
        registry.list_all().into_iter().cloned().collect()
    }

    /// Get a snapshot of connected peers.
    pub async fn connected_peers(&self) -> Vec<PeerRecord> {
        let registry = self.ctx.peers.read().await;
        registry.list_connected().into_iter().cloned().collect()
    }

    /// Start listening, discovery and auto-dialing.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }
        if self.stopped {
            return Err(NetworkError::NotRunning);
        }

        let (shutdown_tx, _) = broadcast::channel(8);

        let mut listener = self
            .ctx
            .transport
            .listen(&self.config.listen_addrs, &shutdown_tx)
            .await?;
        let listen_addrs = listener.local_addrs().to_vec();
        *self.ctx.listen_addrs.write() = listen_addrs.clone();

        // Accept loop.
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            while let Some(conn) = listener.next().await {
                serve_connection(ctx.shared(), conn);
            }
            debug!("Inbound connection loop stopped");
        });

        // Refresh last_seen from gossip traffic.
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        self.ctx.router.set_activity_hook(Arc::new(move |peer: &PeerId| {
            let _ = activity_tx.send(*peer);
        }));
        tokio::spawn(track_activity(
            Arc::clone(&self.ctx.peers),
            activity_rx,
            shutdown_tx.subscribe(),
        ));

        // Start LAN discovery if enabled.
        if self.config.discovery_enabled {
            let (discovered_tx, discovered_rx) = mpsc::channel(64);
            let mut discovery_config = DiscoveryConfig::new(
                self.config.discovery_port,
                Announcement {
                    peer_id: *self.identity.peer_id(),
                    service_tag: self.config.service_tag.clone(),
                    addresses: listen_addrs.clone(),
                },
            );
            discovery_config.broadcast_addr = self.config.broadcast_addr();
            discovery_config.interval = self.config.announce_interval;

            match DiscoveryService::start(
                discovery_config,
                Arc::clone(&self.ctx.peers),
                discovered_tx,
            )
            .await
            {
                Ok(handle) => {
                    self.discovery = Some(handle);
                    let auto = AutoDialer::new(Arc::clone(&self.ctx));
                    tokio::spawn(auto.run(discovered_rx, shutdown_tx.subscribe()));
                }
                Err(e) => warn!("Discovery start failed (non-fatal): {e}"),
            }
        }

        // Connect to known (bootstrap) peers.
        for addr in &self.config.known_peers {
            let addr = *addr;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                match ctx.transport.dial_addr(addr).await {
                    Ok(conn) => {
                        info!("Connected to bootstrap peer {addr}");
                        serve_connection(ctx.shared(), conn);
                    }
                    Err(e) => warn!("Failed to connect to bootstrap peer {addr}: {e}"),
                }
            });
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.running = true;
        info!(
            "MeshNode {} started on {}",
            self.identity.peer_id().short(),
            listen_addrs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Stop the node: discovery first, then goodbye to every peer and close
    /// every connection, then the listeners.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop().await;
        }
        self.ctx.router.shutdown().await;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.ctx.peers.write().await.disconnect_all();

        self.running = false;
        self.stopped = true;
        info!("MeshNode {} stopped", self.identity.peer_id().short());
    }

    /// Connect to a specific address and start serving the connection.
    pub async fn connect(&self, addr: PeerAddr) -> Result<PeerId, NetworkError> {
        if !self.running {
            return Err(NetworkError::NotRunning);
        }
        let conn = self.ctx.transport.dial_addr(addr).await?;
        let peer = *conn.remote_peer();
        self.ctx.peers.write().await.upsert(peer, &[addr]);
        serve_connection(self.ctx.shared(), conn);
        info!("Manually connected to {addr}");
        Ok(peer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
