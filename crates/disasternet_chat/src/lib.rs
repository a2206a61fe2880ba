//! DisasterNet Chat: rooms on top of the gossip mesh.
//!
//! A [`ChatRoom`] binds one gossip topic to an ordered message log, a roster
//! of senders seen so far, and a set of observers notified in append order.
//! [`TranscriptWriter`] persists a room's messages as plain-text lines.

pub mod error;
pub mod message;
pub mod observer;
pub mod room;
pub mod transcript;

pub use error::ChatError;
pub use message::ChatMessage;
pub use observer::ObserverId;
pub use room::{ChatRoom, RoomInfo, room_topic};
pub use transcript::TranscriptWriter;
