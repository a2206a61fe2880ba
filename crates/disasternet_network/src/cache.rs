//! Seen-message cache for duplicate suppression.
//!
//! Entries expire after a fixed TTL and the cache never holds more than
//! `capacity` ids; in both cases the oldest entries go first.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::message::MessageId;

/// Default time an id is remembered.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

/// Default maximum number of remembered ids.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Bounded set of recently seen message ids.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    ttl: Duration,
    ids: HashSet<MessageId>,
    order: VecDeque<(MessageId, Instant)>,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL)
    }
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`. Returns `true` if it was not already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, id: MessageId, now: Instant) -> bool {
        self.expire(now);
        if self.ids.contains(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.ids.insert(id);
        self.order.push_back((id, now));
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
