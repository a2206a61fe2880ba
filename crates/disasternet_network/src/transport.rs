//! Transport: listening for and dialing secure, multiplexed connections.
//!
//! A [`Listener`] accepts TCP and WebSocket links, runs the responder side of
//! the handshake on each, and yields ready [`Connection`]s. Dialing runs the
//! initiator side and checks the remote is the peer we meant to reach.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DialError, NetworkError};
use crate::identity::{NodeIdentity, PeerId};
use crate::link::RawLink;
use crate::mux::Multiplexer;
use crate::peer::{PeerAddr, PeerRecord};
use crate::secure::{DEFAULT_HANDSHAKE_TIMEOUT, Handshake, Role, SecureChannel};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An authenticated, multiplexed connection to a remote peer.
///
/// Clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    remote: PeerId,
    remote_addr: SocketAddr,
    direction: Direction,
    session_id: [u8; 32],
    mux: Multiplexer,
}

impl Connection {
    pub(crate) fn new(channel: SecureChannel, remote_addr: SocketAddr, direction: Direction) -> Self {
        let remote = *channel.remote_peer();
        let session_id = *channel.session_id();
        let role = match direction {
            Direction::Outbound => Role::Initiator,
            Direction::Inbound => Role::Responder,
        };
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            remote_addr,
            direction,
            session_id,
            mux: Multiplexer::new(channel, role),
        }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Shared by both ends, unlike [`id`](Self::id).
    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    /// The peer that dialed this connection.
    pub fn dialer(&self, local: &PeerId) -> PeerId {
        match self.direction {
            Direction::Outbound => *local,
            Direction::Inbound => self.remote,
        }
    }

    /// Close the connection and every stream on it.
    pub fn close(&self) {
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Resolves once the connection is closed from either side.
    pub async fn closed(&self) {
        self.mux.closed().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Stream of inbound connections from one or more listen addresses.
///
/// Ends once every accept loop has stopped. Dropping the listener stops the
/// accept loops.
pub struct Listener {
    local_addrs: Vec<PeerAddr>,
    incoming: mpsc::Receiver<Connection>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Addresses actually bound, with OS-assigned ports resolved.
    pub fn local_addrs(&self) -> &[PeerAddr] {
        &self.local_addrs
    }

    /// Stop accepting.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Stream for Listener {
    type Item = Connection;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Connection>> {
        self.get_mut().incoming.poll_recv(cx)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listens for and dials connections on behalf of one identity.
#[derive(Clone)]
pub struct Transport {
    identity: Arc<NodeIdentity>,
    handshake_timeout: Duration,
}

impl Transport {
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        Self {
            identity,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Bound on connect plus handshake, per address.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Bind every address and start accepting.
    ///
    /// Each accept loop runs until `shutdown` fires or the listener is
    /// dropped. Fails if any address cannot be bound.
    pub async fn listen(
        &self,
        addrs: &[PeerAddr],
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Listener, NetworkError> {
        let (tx, rx) = mpsc::channel(64);
        let mut local_addrs = Vec::with_capacity(addrs.len());
        let mut tasks = Vec::with_capacity(addrs.len());

        for addr in addrs {
            let tcp = TcpListener::bind(addr.socket_addr()).await?;
            let bound = addr.with_socket_addr(tcp.local_addr()?);
            info!("Listening on {bound}");
            local_addrs.push(bound);
            tasks.push(tokio::spawn(accept_loop(
                tcp,
                bound,
                Arc::clone(&self.identity),
                self.handshake_timeout,
                tx.clone(),
                shutdown.subscribe(),
            )));
        }

        Ok(Listener {
            local_addrs,
            incoming: rx,
            tasks,
        })
    }

    /// Dial a known peer, trying each address in order.
    ///
    /// The first address that completes a handshake with the expected peer
    /// wins.
    pub async fn dial(&self, record: &PeerRecord) -> Result<Connection, DialError> {
        if record.known_addresses.is_empty() {
            return Err(DialError::NoAddresses(record.id));
        }
        let mut last_error = String::new();
        let mut attempts = 0;
        for addr in &record.known_addresses {
            attempts += 1;
            match self.dial_one(*addr, Some(record.id)).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("Dial {} via {addr} failed: {e}", record.id.short());
                    last_error = e.to_string();
                }
            }
        }
        Err(DialError::Unreachable {
            peer: record.id,
            attempts,
            last_error,
        })
    }

    /// Dial a single address without knowing who is there.
    pub async fn dial_addr(&self, addr: PeerAddr) -> Result<Connection, DialError> {
        self.dial_one(addr, None).await
    }

    async fn dial_one(&self, addr: PeerAddr, expected: Option<PeerId>) -> Result<Connection, DialError> {
        let identity = Arc::clone(&self.identity);
        let timeout = self.handshake_timeout;
        let attempt = async move {
            let link = match addr {
                PeerAddr::Tcp(sock) => RawLink::connect_tcp(sock).await,
                PeerAddr::Ws(sock) => RawLink::connect_ws(sock).await,
            }
            .map_err(|e| e.to_string())?;

            let mut handshake = Handshake::new(&identity, Role::Initiator).timeout(timeout);
            if let Some(peer) = expected {
                handshake = handshake.expect_peer(peer);
            }
            let channel = handshake.run(link).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(Connection::new(channel, addr.socket_addr(), Direction::Outbound))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(conn)) => {
                debug!("Connected to {} at {addr}", conn.remote_peer().short());
                Ok(conn)
            }
            Ok(Err(reason)) => Err(DialError::Address { addr, reason }),
            Err(_) => Err(DialError::Address {
                addr,
                reason: format!("timed out after {timeout:?}"),
            }),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: PeerAddr,
    identity: Arc<NodeIdentity>,
    timeout: Duration,
    tx: mpsc::Sender<Connection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        stream.set_nodelay(true).ok();
                        let identity = Arc::clone(&identity);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let upgrade = async {
                                let link = match local {
                                    PeerAddr::Tcp(_) => RawLink::Tcp(stream),
                                    PeerAddr::Ws(_) => RawLink::accept_ws(stream)
                                        .await
                                        .map_err(|e| e.to_string())?,
                                };
                                Handshake::new(&identity, Role::Responder)
                                    .timeout(timeout)
                                    .run(link)
                                    .await
                                    .map_err(|e| e.to_string())
                            };
                            match tokio::time::timeout(timeout, upgrade).await {
                                Ok(Ok(channel)) => {
                                    let conn = Connection::new(channel, peer_addr, Direction::Inbound);
                                    debug!("Accepted {} from {peer_addr}", conn.remote_peer().short());
                                    let _ = tx.send(conn).await;
                                }
                                Ok(Err(e)) => warn!("Inbound handshake from {peer_addr} failed: {e}"),
                                Err(_) => warn!("Inbound handshake from {peer_addr} timed out"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept on {local} failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Listener on {local} shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A connected pair over loopback TCP; `a` dials `b`.
#[cfg(test)]
pub(crate) async fn connection_pair(a: &NodeIdentity, b: &NodeIdentity) -> (Connection, Connection) {
    let (la, lb) = crate::link::tcp_pair().await;
    let (ca, cb) = tokio::join!(
        Handshake::new(a, Role::Initiator).run(la),
        Handshake::new(b, Role::Responder).run(lb)
    );
    let unspecified: SocketAddr = "127.0.0.1:0".parse().unwrap();
    (
        Connection::new(ca.unwrap(), unspecified, Direction::Outbound),
        Connection::new(cb.unwrap(), unspecified, Direction::Inbound),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn transport() -> Transport {
        Transport::new(Arc::new(NodeIdentity::generate()))
            .with_handshake_timeout(Duration::from_secs(2))
    }

    fn loopback() -> Vec<PeerAddr> {
        vec![
            "tcp://127.0.0.1:0".parse().unwrap(),
            "ws://127.0.0.1:0".parse().unwrap(),
        ]
    }

    #[tokio::test]
    async fn test_listen_resolves_ports() {
        let (shutdown, _) = broadcast::channel(1);
        let listener = transport().listen(&loopback(), &shutdown).await.unwrap();
        assert_eq!(listener.local_addrs().len(), 2);
        assert!(matches!(listener.local_addrs()[0], PeerAddr::Tcp(_)));
        assert!(matches!(listener.local_addrs()[1], PeerAddr::Ws(_)));
        for addr in listener.local_addrs() {
            assert_ne!(addr.socket_addr().port(), 0);
        }
    }

    #[tokio::test]
    async fn test_dial_over_each_transport() {
        let (shutdown, _) = broadcast::channel(1);
        let server = transport();
        let client = transport();
        let mut listener = server.listen(&loopback(), &shutdown).await.unwrap();

        for addr in listener.local_addrs().to_vec() {
            let record = PeerRecord::new(*server.local_peer_id(), vec![addr]);
            let outbound = client.dial(&record).await.unwrap();
            let inbound = listener.next().await.unwrap();

            assert_eq!(outbound.remote_peer(), server.local_peer_id());
            assert_eq!(outbound.direction(), Direction::Outbound);
            assert_eq!(inbound.remote_peer(), client.local_peer_id());
            assert_eq!(inbound.direction(), Direction::Inbound);
            assert_eq!(
                outbound.dialer(client.local_peer_id()),
                inbound.dialer(server.local_peer_id())
            );

            let stream = outbound.mux().open_stream("ping").unwrap();
            stream.send(b"ping").await.unwrap();
            let mut accepted = inbound.mux().accept_stream().await.unwrap();
            assert_eq!(accepted.recv().await.unwrap(), b"ping");
        }
    }

    #[tokio::test]
    async fn test_dial_falls_through_to_working_address() {
        let (shutdown, _) = broadcast::channel(1);
        let server = transport();
        let listener = server.listen(&loopback()[..1], &shutdown).await.unwrap();

        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = PeerAddr::Tcp(dead.local_addr().unwrap());
        drop(dead);

        let record = PeerRecord::new(
            *server.local_peer_id(),
            vec![dead_addr, listener.local_addrs()[0]],
        );
        let conn = transport().dial(&record).await.unwrap();
        assert_eq!(conn.remote_peer(), server.local_peer_id());
    }

    #[tokio::test]
    async fn test_dial_wrong_peer_is_unreachable() {
        let (shutdown, _) = broadcast::channel(1);
        let server = transport();
        let listener = server.listen(&loopback()[..1], &shutdown).await.unwrap();

        let impostor = *NodeIdentity::generate().peer_id();
        let record = PeerRecord::new(impostor, listener.local_addrs().to_vec());
        match transport().dial(&record).await {
            Err(DialError::Unreachable { peer, attempts, .. }) => {
                assert_eq!(peer, impostor);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dial_without_addresses() {
        let id = *NodeIdentity::generate().peer_id();
        let record = PeerRecord::new(id, Vec::new());
        assert!(matches!(
            transport().dial(&record).await,
            Err(DialError::NoAddresses(p)) if p == id
        ));
    }

    #[tokio::test]
    async fn test_dial_addr_learns_peer_id() {
        let (shutdown, _) = broadcast::channel(1);
        let server = transport();
        let listener = server.listen(&loopback()[..1], &shutdown).await.unwrap();
        let conn = transport().dial_addr(listener.local_addrs()[0]).await.unwrap();
        assert_eq!(conn.remote_peer(), server.local_peer_id());
    }

    #[tokio::test]
    async fn test_shutdown_ends_listener() {
        let (shutdown, _) = broadcast::channel(1);
        let mut listener = transport().listen(&loopback(), &shutdown).await.unwrap();
        shutdown.send(()).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), listener.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
