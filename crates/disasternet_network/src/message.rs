//! Gossip wire types: data messages, control frames, and stream purposes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DecodeError;
use crate::identity::PeerId;
use crate::peer::PeerAddr;

/// Largest gossip payload accepted for publish or relay.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Stream carrying [`ControlFrame`]s.
pub const STREAM_CONTROL: &str = "/disasternet/gossip/ctl/1";
/// Stream carrying [`GossipMessage`]s.
pub const STREAM_DATA: &str = "/disasternet/gossip/data/1";
/// Stream carrying a single [`Identify`] record.
pub const STREAM_IDENTIFY: &str = "/disasternet/identify/1";

/// Identifier of a gossip message, derived from its content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

/// A message flooded through the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Peer that published the message.
    pub source: PeerId,
    /// Publisher-local sequence number.
    pub seqno: u64,
    pub topic: String,
    /// Opaque payload, hex-encoded on the wire.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl GossipMessage {
    /// Content digest over source, seqno, topic and data.
    pub fn id(&self) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update(self.seqno.to_be_bytes());
        hasher.update((self.topic.len() as u32).to_be_bytes());
        hasher.update(self.topic.as_bytes());
        hasher.update(&self.data);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        MessageId(id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        // Hex doubles the payload; leave room for the envelope fields.
        let max_encoded = MAX_MESSAGE_SIZE * 2 + 4096;
        if bytes.len() > max_encoded {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                max: max_encoded,
            });
        }
        let msg: Self = serde_json::from_slice(bytes)?;
        if msg.data.len() > MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge {
                size: msg.data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        if msg.topic.is_empty() {
            return Err(DecodeError::Frame("empty topic".into()));
        }
        Ok(msg)
    }
}

/// Subscription and lifecycle signalling between two connected routers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// The sender is leaving for good; forget it when the connection closes.
    Goodbye,
}

impl ControlFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Self-description sent once per connection so the remote learns our
/// dialable addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub peer_id: PeerId,
    pub listen_addrs: Vec<PeerAddr>,
    pub agent: String,
}

impl Identify {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
