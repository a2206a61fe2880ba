//! Gossip router: topic subscriptions and flood propagation.
//!
//! Every attached connection carries two outbound streams, one for
//! [`ControlFrame`]s and one for [`GossipMessage`]s, each fed from a bounded
//! drop-oldest queue by its own writer task. A message is delivered to local
//! handlers once and forwarded to every subscribed peer except the one it
//! came from and its source; the seen cache stops it from circling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL, SeenCache};
use crate::error::PublishError;
use crate::identity::PeerId;
use crate::message::{
    ControlFrame, GossipMessage, MAX_MESSAGE_SIZE, MessageId, STREAM_CONTROL, STREAM_DATA,
};
use crate::mux::MuxStream;
use crate::transport::Connection;

/// Default depth of each per-connection outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long a closing link waits for its readers to drain.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long shutdown waits for queued frames to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A local handler for messages on a topic.
pub type MessageHandler = Arc<dyn Fn(&GossipMessage) + Send + Sync>;

/// Called with the sending peer for every inbound gossip frame.
pub type ActivityHook = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Handle returned by [`GossipRouter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub queue_capacity: usize,
    pub seen_capacity: usize,
    pub seen_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_ttl: DEFAULT_SEEN_TTL,
        }
    }
}

/// Outcome of [`GossipRouter::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// No link with that connection id was attached.
    NotAttached,
    /// The link closed without the peer saying goodbye.
    Closed,
    /// The peer announced it was leaving before the link closed.
    Departed,
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Bounded frame queue that drops the oldest frame when full.
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame. Returns `false` if an older frame was dropped to make
    /// room or the queue is closed.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let mut kept_all = true;
        if state.frames.len() >= state.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            kept_all = false;
        }
        state.frames.push_back(frame);
        drop(state);
        self.notify.notify_one();
        kept_all
    }

    /// Next frame, or `None` once closed and empty.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting frames; queued frames are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

async fn drain_queue(queue: Arc<OutboundQueue>, stream: MuxStream) {
    while let Some(frame) = queue.pop().await {
        if let Err(e) = stream.send(&frame).await {
            debug!("Outbound stream {} ended: {e}", stream.purpose());
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct PeerLink {
    conn: Connection,
    control: Arc<OutboundQueue>,
    data: Arc<OutboundQueue>,
    writers: Vec<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
    /// Topics the remote is subscribed to.
    topics: HashSet<String>,
    departed: bool,
}

impl PeerLink {
    fn close_queues(&self) {
        self.control.close();
        self.data.close();
    }
}

struct RouterState {
    handlers: HashMap<String, Vec<(SubscriptionId, MessageHandler)>>,
    links: HashMap<PeerId, PeerLink>,
    seen: SeenCache,
    next_subscription: u64,
    seqno: u64,
    shutdown: bool,
}

struct RouterInner {
    local: PeerId,
    config: RouterConfig,
    state: Mutex<RouterState>,
    activity: Mutex<Option<ActivityHook>>,
}

/// Topic-based flood router. Cheap to clone.
#[derive(Clone)]
pub struct GossipRouter {
    inner: Arc<RouterInner>,
}

impl GossipRouter {
    pub fn new(local: PeerId, config: RouterConfig) -> Self {
        let seen = SeenCache::new(config.seen_capacity, config.seen_ttl);
        Self {
            inner: Arc::new(RouterInner {
                local,
                config,
                state: Mutex::new(RouterState {
                    handlers: HashMap::new(),
                    links: HashMap::new(),
                    seen,
                    next_subscription: 1,
                    seqno: Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
                    shutdown: false,
                }),
                activity: Mutex::new(None),
            }),
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local
    }

    /// Install `hook`, replacing any previous one.
    pub fn set_activity_hook(&self, hook: ActivityHook) {
        *self.inner.activity.lock() = Some(hook);
    }

    fn note_activity(&self, peer: &PeerId) {
        let hook = self.inner.activity.lock().clone();
        if let Some(hook) = hook {
            hook(peer);
        }
    }

    // -- Subscriptions ------------------------------------------------------

    /// Register `handler` for `topic`. The first local subscription to a
    /// topic announces it to every connected peer.
    pub fn subscribe(&self, topic: &str, handler: MessageHandler) -> SubscriptionId {
        let mut state = self.inner.state.lock();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;

        let entry = state.handlers.entry(topic.to_string()).or_default();
        let first = entry.is_empty();
        entry.push((id, handler));

        if first {
            debug!("Subscribed to {topic}");
            broadcast_control(
                &state.links,
                &ControlFrame::Subscribe {
                    topic: topic.to_string(),
                },
            );
        }
        id
    }

    /// Channel form of [`subscribe`](Self::subscribe).
    pub fn subscribe_channel(
        &self,
        topic: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<GossipMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(
            topic,
            Arc::new(move |msg: &GossipMessage| {
                let _ = tx.send(msg.clone());
            }),
        );
        (id, rx)
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(topic) = state
            .handlers
            .iter()
            .find(|(_, subs)| subs.iter().any(|(sid, _)| *sid == id))
            .map(|(topic, _)| topic.clone())
        else {
            return false;
        };

        let now_empty = match state.handlers.get_mut(&topic) {
            Some(subs) => {
                subs.retain(|(sid, _)| *sid != id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.handlers.remove(&topic);
            debug!("Unsubscribed from {topic}");
            broadcast_control(&state.links, &ControlFrame::Unsubscribe { topic });
        }
        true
    }

    /// Topics with at least one local subscription.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.state.lock().handlers.keys().cloned().collect()
    }

    // -- Publishing ---------------------------------------------------------

    /// Publish `data` on `topic`.
    ///
    /// Local handlers run before this returns. Succeeds even with no peers.
    pub fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, PublishError> {
        if topic.is_empty() {
            return Err(PublishError::EmptyTopic);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(PublishError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let (msg, handlers) = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(PublishError::Shutdown);
            }
            state.seqno = state.seqno.wrapping_add(1);
            let msg = GossipMessage {
                source: self.inner.local,
                seqno: state.seqno,
                topic: topic.to_string(),
                data,
            };
            state.seen.insert(msg.id());
            forward(&state.links, &msg, None);
            (msg, local_handlers(&state, topic))
        };

        let id = msg.id();
        trace!("Published {id} on {topic}");
        for handler in handlers {
            handler(&msg);
        }
        Ok(id)
    }

    /// Handle a message received from `from`.
    ///
    /// Returns `true` if it was new and delivered.
    pub fn receive(&self, from: &PeerId, msg: GossipMessage) -> bool {
        let handlers = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return false;
            }
            if !state.seen.insert(msg.id()) {
                trace!("Dropping duplicate {} from {}", msg.id(), from.short());
                return false;
            }
            forward(&state.links, &msg, Some(from));
            local_handlers(&state, &msg.topic)
        };
        for handler in handlers {
            handler(&msg);
        }
        true
    }

    /// Decode and handle a frame from a peer's data stream.
    pub fn handle_data_bytes(&self, from: &PeerId, bytes: &[u8]) {
        match GossipMessage::from_bytes(bytes) {
            Ok(msg) => {
                self.receive(from, msg);
            }
            Err(e) => warn!("Dropping bad gossip frame from {}: {e}", from.short()),
        }
    }

    /// Decode and handle a frame from a peer's control stream.
    pub fn handle_control_bytes(&self, from: &PeerId, bytes: &[u8]) {
        let frame = match ControlFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping bad control frame from {}: {e}", from.short());
                return;
            }
        };
        let mut state = self.inner.state.lock();
        let Some(link) = state.links.get_mut(from) else {
            return;
        };
        match frame {
            ControlFrame::Subscribe { topic } => {
                trace!("{} subscribed to {topic}", from.short());
                link.topics.insert(topic);
            }
            ControlFrame::Unsubscribe { topic } => {
                trace!("{} unsubscribed from {topic}", from.short());
                link.topics.remove(&topic);
            }
            ControlFrame::Goodbye => {
                debug!("{} said goodbye", from.short());
                link.departed = true;
            }
        }
    }

    // -- Connections --------------------------------------------------------

    /// Start routing over `conn`.
    ///
    /// When a second connection to the same peer shows up, the one dialed
    /// by the lower peer id is kept on both ends; between two dialed by the
    /// same side, the lower session id wins. Returns `false` if `conn` lost
    /// and should be closed.
    pub fn attach(&self, conn: &Connection) -> bool {
        let peer = *conn.remote_peer();
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return false;
        }

        if let Some(existing) = state.links.get(&peer) {
            if existing.conn.id() == conn.id() {
                return true;
            }
            let local = self.inner.local;
            let old_dialer = existing.conn.dialer(&local);
            let new_dialer = conn.dialer(&local);
            let keep_existing = if existing.conn.is_closed() {
                false
            } else if old_dialer == new_dialer {
                existing.conn.session_id() < conn.session_id()
            } else {
                old_dialer == local.min(peer)
            };
            if keep_existing {
                debug!("Keeping existing connection to {}", peer.short());
                return false;
            }
            if let Some(old) = state.links.remove(&peer) {
                debug!("Replacing connection to {}", peer.short());
                old.close_queues();
                old.conn.close();
            }
        }

        let link = match self.open_link(conn, &state) {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not open gossip streams to {}: {e}", peer.short());
                return false;
            }
        };
        state.links.insert(peer, link);
        info!("Routing to {} ({} links)", peer.short(), state.links.len());
        true
    }

    fn open_link(
        &self,
        conn: &Connection,
        state: &RouterState,
    ) -> Result<PeerLink, crate::error::MuxError> {
        let control_stream = conn.mux().open_stream(STREAM_CONTROL)?;
        let data_stream = conn.mux().open_stream(STREAM_DATA)?;
        let control = Arc::new(OutboundQueue::new(self.inner.config.queue_capacity));
        let data = Arc::new(OutboundQueue::new(self.inner.config.queue_capacity));

        for topic in state.handlers.keys() {
            if let Ok(frame) = (ControlFrame::Subscribe {
                topic: topic.clone(),
            })
            .to_bytes()
            {
                control.push(frame);
            }
        }

        let writers = vec![
            tokio::spawn(drain_queue(Arc::clone(&control), control_stream)),
            tokio::spawn(drain_queue(Arc::clone(&data), data_stream)),
        ];
        Ok(PeerLink {
            conn: conn.clone(),
            control,
            data,
            writers,
            readers: Vec::new(),
            topics: HashSet::new(),
            departed: false,
        })
    }

    /// Take an inbound stream the remote opened.
    ///
    /// Gossip streams on the attached connection are consumed; anything
    /// else is handed back.
    pub fn accept_stream(&self, conn: &Connection, stream: MuxStream) -> Option<MuxStream> {
        let is_control = match stream.purpose() {
            STREAM_CONTROL => true,
            STREAM_DATA => false,
            _ => return Some(stream),
        };
        let peer = *conn.remote_peer();
        let mut state = self.inner.state.lock();
        let Some(link) = state.links.get_mut(&peer) else {
            return None;
        };
        if link.conn.id() != conn.id() {
            return None;
        }

        let router = self.clone();
        let mut stream = stream;
        let reader = tokio::spawn(async move {
            while let Some(bytes) = stream.recv().await {
                router.note_activity(&peer);
                if is_control {
                    router.handle_control_bytes(&peer, &bytes);
                } else {
                    router.handle_data_bytes(&peer, &bytes);
                }
            }
            trace!("Inbound {} stream from {} ended", stream.purpose(), peer.short());
        });
        link.readers.push(reader);
        None
    }

    /// Stop routing over the connection with id `conn_id`.
    ///
    /// Waits briefly for that link's readers so a trailing goodbye is seen.
    pub async fn detach(&self, peer: &PeerId, conn_id: u64) -> Detached {
        let readers = {
            let mut state = self.inner.state.lock();
            match state.links.get_mut(peer) {
                Some(link) if link.conn.id() == conn_id => std::mem::take(&mut link.readers),
                _ => return Detached::NotAttached,
            }
        };
        for reader in readers {
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
        }

        let link = {
            let mut state = self.inner.state.lock();
            match state.links.get(peer) {
                Some(link) if link.conn.id() == conn_id => state.links.remove(peer),
                _ => None,
            }
        };
        let Some(link) = link else {
            return Detached::NotAttached;
        };
        link.close_queues();
        link.conn.close();
        debug!("Detached {}", peer.short());
        if link.departed {
            Detached::Departed
        } else {
            Detached::Closed
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.state.lock().links.contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().links.keys().copied().collect()
    }

    /// Connected peers that have subscribed to `topic`.
    pub fn peers_for_topic(&self, topic: &str) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .links
            .iter()
            .filter(|(_, link)| link.topics.contains(topic))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Say goodbye to every peer, flush, and close all connections.
    ///
    /// Later publishes fail with [`PublishError::Shutdown`].
    pub async fn shutdown(&self) {
        let links: Vec<PeerLink> = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            broadcast_control(&state.links, &ControlFrame::Goodbye);
            state.links.drain().map(|(_, link)| link).collect()
        };

        for link in &links {
            if !link.data.is_empty() {
                debug!(
                    "Flushing {} queued message(s) to {}",
                    link.data.len(),
                    link.conn.remote_peer().short()
                );
            }
            link.close_queues();
        }
        for link in links {
            for writer in link.writers {
                let _ = tokio::time::timeout(FLUSH_TIMEOUT, writer).await;
            }
            link.conn.close();
        }
        info!("Gossip router shut down");
    }
}

fn local_handlers(state: &RouterState, topic: &str) -> Vec<MessageHandler> {
    state
        .handlers
        .get(topic)
        .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
        .unwrap_or_default()
}

fn broadcast_control(links: &HashMap<PeerId, PeerLink>, frame: &ControlFrame) {
    let bytes = match frame.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode control frame: {e}");
            return;
        }
    };
    for link in links.values() {
        link.control.push(bytes.clone());
    }
}

/// Queue `msg` to every subscribed peer except `from` and the source.
fn forward(links: &HashMap<PeerId, PeerLink>, msg: &GossipMessage, from: Option<&PeerId>) {
    let mut encoded = None;
    for (peer, link) in links {
        if Some(peer) == from || *peer == msg.source || !link.topics.contains(&msg.topic) {
            continue;
        }
        if encoded.is_none() {
            match msg.to_bytes() {
                Ok(bytes) => encoded = Some(bytes),
                Err(e) => {
                    warn!("Failed to encode gossip message: {e}");
                    return;
                }
            }
        }
        if let Some(bytes) = &encoded {
            if !link.data.push(bytes.clone()) {
                debug!("Outbound queue to {} full, dropped oldest", peer.short());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
