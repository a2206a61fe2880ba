//! Chat room: one gossip topic, an ordered log, a roster and observers.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use disasternet_network::{GossipMessage, GossipRouter, SubscriptionId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::message::ChatMessage;
use crate::observer::{ObserverId, ObserverRegistry};

/// Gossip topic carrying messages for `room`.
pub fn room_topic(room: &str) -> String {
    format!("disasternet-room-{room}")
}

/// Summary returned by [`ChatRoom::info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub room: String,
    pub nickname: String,
    /// Short form of the local peer id.
    pub peer_id: String,
    /// Number of distinct senders seen, self included.
    pub peers: usize,
    pub messages: usize,
}

#[derive(Default)]
struct RoomState {
    log: Vec<ChatMessage>,
    ids: HashSet<String>,
    /// `(sender_id, nickname)` in first-seen order, latest nickname.
    roster: Vec<(String, String)>,
    subscription: Option<SubscriptionId>,
    pending: VecDeque<ChatMessage>,
    draining: bool,
}

struct RoomInner {
    router: GossipRouter,
    room: String,
    topic: String,
    nickname: String,
    short_id: String,
    counter: AtomicU64,
    state: Mutex<RoomState>,
    observers: Mutex<ObserverRegistry>,
}

/// A chat room bound to a [`GossipRouter`].
///
/// Cloning is cheap; clones share the same log and observers.
#[derive(Clone)]
pub struct ChatRoom {
    inner: Arc<RoomInner>,
}

impl ChatRoom {
    pub fn new(router: GossipRouter, room: &str, nickname: &str) -> Self {
        let short_id = router.local_peer_id().short();
        Self {
            inner: Arc::new(RoomInner {
                router,
                room: room.to_string(),
                topic: room_topic(room),
                nickname: nickname.to_string(),
                short_id,
                counter: AtomicU64::new(0),
                state: Mutex::new(RoomState::default()),
                observers: Mutex::new(ObserverRegistry::default()),
            }),
        }
    }

    pub fn room(&self) -> &str {
        &self.inner.room
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn nickname(&self) -> &str {
        &self.inner.nickname
    }

    pub fn is_joined(&self) -> bool {
        self.inner.state.lock().subscription.is_some()
    }

    /// Join the room. Calling it again while joined does nothing.
    pub fn subscribe(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.subscription.is_some() {
                return;
            }
            let short_id = self.inner.short_id.clone();
            if !state.roster.iter().any(|(id, _)| *id == short_id) {
                state.roster.push((short_id, self.inner.nickname.clone()));
            }
        }

        let weak: Weak<RoomInner> = Arc::downgrade(&self.inner);
        let id = self.inner.router.subscribe(
            &self.inner.topic,
            Arc::new(move |msg: &GossipMessage| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_gossip(msg);
                }
            }),
        );

        let mut state = self.inner.state.lock();
        match state.subscription {
            // Lost a race with a concurrent subscribe.
            Some(_) => {
                drop(state);
                self.inner.router.unsubscribe(id);
            }
            None => {
                state.subscription = Some(id);
                info!("Joined room '{}' as {}", self.inner.room, self.inner.nickname);
            }
        }
    }

    /// Leave the room. The log and roster are kept.
    pub fn leave(&self) {
        let sub = self.inner.state.lock().subscription.take();
        if let Some(id) = sub {
            self.inner.router.unsubscribe(id);
            info!("Left room '{}'", self.inner.room);
        }
    }

    /// Publish `body` to the room.
    ///
    /// On success the message is already in [`messages`](Self::messages).
    pub fn send_message(&self, body: &str) -> Result<ChatMessage, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::Validation("message is empty".into()));
        }
        if !self.is_joined() {
            return Err(ChatError::NotJoined(self.inner.room.clone()));
        }

        let counter = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = ChatMessage::new(&self.inner.nickname, &self.inner.short_id, body, counter);
        let bytes = msg.to_bytes()?;
        self.inner.router.publish(&self.inner.topic, bytes)?;
        Ok(msg)
    }

    /// Snapshot of the log in append order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().log.clone()
    }

    /// Nicknames of every sender seen, in first-seen order.
    ///
    /// A sender that changes nickname keeps its place and shows the newest.
    pub fn peers_in_room(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .roster
            .iter()
            .map(|(_, nick)| nick.clone())
            .collect()
    }

    pub fn info(&self) -> RoomInfo {
        let state = self.inner.state.lock();
        RoomInfo {
            room: self.inner.room.clone(),
            nickname: self.inner.nickname.clone(),
            peer_id: self.inner.short_id.clone(),
            peers: state.roster.len(),
            messages: state.log.len(),
        }
    }

    /// Register `observer` for every message appended from now on.
    pub fn on_message<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.inner.observers.lock().add(Arc::new(observer))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.lock().remove(id)
    }

    /// Channel form of [`on_message`](Self::on_message).
    pub fn message_stream(&self) -> (ObserverId, mpsc::UnboundedReceiver<ChatMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on_message(move |msg| {
            let _ = tx.send(msg.clone());
        });
        (id, rx)
    }
}

impl RoomInner {
    fn handle_gossip(&self, gossip: &GossipMessage) {
        match ChatMessage::from_bytes(&gossip.data) {
            Ok(msg) => self.append(msg),
            Err(e) => warn!(
                "Dropping undecodable chat message from {}: {e}",
                gossip.source.short()
            ),
        }
    }

    /// Append to the log and notify observers in append order.
    ///
    /// Only one caller drains at a time; appends made from inside an
    /// observer are queued and delivered after the current message.
    fn append(&self, msg: ChatMessage) {
        {
            let mut state = self.state.lock();
            if !state.ids.insert(msg.id.clone()) {
                debug!("Ignoring repeated chat message {}", msg.id);
                return;
            }
            match state.roster.iter().position(|(id, _)| *id == msg.sender_id) {
                Some(i) => state.roster[i].1 = msg.sender.clone(),
                None => state
                    .roster
                    .push((msg.sender_id.clone(), msg.sender.clone())),
            }
            state.log.push(msg.clone());
            state.pending.push_back(msg);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(msg) => msg,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            let observers = self.observers.lock().snapshot();
            for observer in observers {
                observer(&next);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use disasternet_network::router::RouterConfig;
    use disasternet_network::{NodeIdentity, PublishError};

    fn router() -> GossipRouter {
        GossipRouter::new(*NodeIdentity::generate().peer_id(), RouterConfig::default())
    }

    fn joined(nick: &str) -> ChatRoom {
        let room = ChatRoom::new(router(), "alpha", nick);
        room.subscribe();
        room
    }

    fn remote(nick: &str, sender_id: &str, body: &str, seqno: u64) -> GossipMessage {
        let msg = ChatMessage::new(nick, sender_id, body, seqno);
        GossipMessage {
            source: *NodeIdentity::generate().peer_id(),
            seqno,
            topic: room_topic("alpha"),
            data: msg.to_bytes().unwrap(),
        }
    }

    #[test]
    fn test_topic_name() {
        let room = ChatRoom::new(router(), "emergency-room", "Alice");
        assert_eq!(room.topic(), "disasternet-room-emergency-room");
    }

    #[test]
    fn test_send_delivers_locally() {
        let room = joined("Alice");
        let sent = room.send_message("need water").unwrap();

        let log = room.messages();
        assert_eq!(log, vec![sent.clone()]);
        assert_eq!(sent.sender, "Alice");
        assert_eq!(sent.sender_id, room.info().peer_id);
    }

    #[test]
    fn test_send_validation() {
        let room = joined("Alice");
        assert!(matches!(room.send_message(""), Err(ChatError::Validation(_))));
        assert!(matches!(room.send_message("  \n\t"), Err(ChatError::Validation(_))));
        assert!(room.messages().is_empty());
    }

    #[test]
    fn test_send_before_join() {
        let room = ChatRoom::new(router(), "alpha", "Alice");
        assert!(matches!(room.send_message("hi"), Err(ChatError::NotJoined(r)) if r == "alpha"));
    }

    #[tokio::test]
    async fn test_send_after_shutdown() {
        let room = joined("Alice");
        room.inner.router.shutdown().await;
        assert!(matches!(
            room.send_message("hi"),
            Err(ChatError::Publish(PublishError::Shutdown))
        ));
    }

    #[test]
    fn test_duplicate_gossip_appended_once() {
        let room = joined("Alice");
        let msg = remote("Bob", "bbbbbbbb", "hello", 1);
        let from = *NodeIdentity::generate().peer_id();

        assert!(room.inner.router.receive(&from, msg.clone()));
        assert!(!room.inner.router.receive(&from, msg));
        assert_eq!(room.messages().len(), 1);
    }

    #[test]
    fn test_roster_first_seen_order() {
        let room = joined("Alice");
        let from = *NodeIdentity::generate().peer_id();
        for i in 0..10 {
            room.inner
                .router
                .receive(&from, remote("Bob", "bbbbbbbb", "ping", i));
        }
        room.inner
            .router
            .receive(&from, remote("Carol", "cccccccc", "here", 100));

        assert_eq!(room.peers_in_room(), vec!["Alice", "Bob", "Carol"]);
        let info = room.info();
        assert_eq!(info.peers, 3);
        assert_eq!(info.messages, 11);
        assert_eq!(info.room, "alpha");
    }

    #[test]
    fn test_roster_shows_latest_nickname() {
        let room = joined("Alice");
        let from = *NodeIdentity::generate().peer_id();
        room.inner
            .router
            .receive(&from, remote("Bob", "bbbbbbbb", "hi", 1));
        room.inner
            .router
            .receive(&from, remote("Carol", "cccccccc", "hey", 2));
        room.inner
            .router
            .receive(&from, remote("Robert", "bbbbbbbb", "renamed", 3));

        assert_eq!(room.peers_in_room(), vec!["Alice", "Robert", "Carol"]);
    }

    #[test]
    fn test_same_message_via_two_peers_notifies_once() {
        let room = joined("Alice");
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        room.on_message(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let msg = remote("Bob", "bbbbbbbb", "hello", 1);
        let via_b = *NodeIdentity::generate().peer_id();
        let via_c = *NodeIdentity::generate().peer_id();
        assert!(room.inner.router.receive(&via_b, msg.clone()));
        assert!(!room.inner.router.receive(&via_c, msg.clone()));

        // Republished under a new gossip id, the chat id still matches.
        let mut copy = msg;
        copy.seqno += 1000;
        room.inner.router.receive(&via_c, copy);

        assert_eq!(room.messages().len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undecodable_payload_dropped() {
        let room = joined("Alice");
        let from = *NodeIdentity::generate().peer_id();
        let mut msg = remote("Bob", "bbbbbbbb", "x", 1);
        msg.data = b"not json".to_vec();
        room.inner.router.receive(&from, msg);
        assert!(room.messages().is_empty());
        assert_eq!(room.peers_in_room(), vec!["Alice"]);
    }

    #[test]
    fn test_reentrant_observer_keeps_order() {
        let room = joined("Alice");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let replier = room.clone();
        room.on_message(move |msg| {
            if msg.message == "ping" {
                replier.send_message("pong").unwrap();
            }
        });
        let sink = Arc::clone(&seen);
        room.on_message(move |msg| sink.lock().push(msg.message.clone()));

        room.send_message("ping").unwrap();

        assert_eq!(*seen.lock(), vec!["ping", "pong"]);
        let log: Vec<_> = room.messages().into_iter().map(|m| m.message).collect();
        assert_eq!(log, vec!["ping", "pong"]);
    }

    #[test]
    fn test_remove_observer() {
        let room = joined("Alice");
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = room.on_message(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        room.send_message("one").unwrap();
        assert!(room.remove_observer(id));
        room.send_message("two").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_message_stream() {
        let room = joined("Alice");
        let (_id, mut rx) = room.message_stream();
        room.send_message("first").unwrap();
        room.send_message("second").unwrap();

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert_eq!(rx.recv().await.unwrap().message, "second");
    }

    #[test]
    fn test_leave_stops_delivery() {
        let room = joined("Alice");
        room.subscribe();
        assert_eq!(room.inner.router.subscribed_topics().len(), 1);

        room.leave();
        assert!(!room.is_joined());
        assert!(room.inner.router.subscribed_topics().is_empty());

        let from = *NodeIdentity::generate().peer_id();
        room.inner
            .router
            .receive(&from, remote("Bob", "bbbbbbbb", "late", 1));
        assert!(room.messages().is_empty());
        assert!(matches!(room.send_message("hi"), Err(ChatError::NotJoined(_))));
    }
}
