//! Network error types.
//!
//! Each layer has its own error enum so callers can tell contained,
//! connection-level failures (handshake, dial, decode) apart from the ones
//! caused by their own request (publish).

use std::time::Duration;

use crate::identity::PeerId;
use crate::peer::PeerAddr;

/// Failure while establishing a secure channel.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The remote speaks a different handshake version.
    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },

    /// A handshake message had the wrong shape.
    #[error("Malformed handshake message: {0}")]
    Malformed(String),

    /// Signature or key agreement check failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote authenticated as a different peer than the one dialed.
    #[error("Peer mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    /// The handshake did not complete in time.
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The link closed or failed mid-handshake.
    #[error("Link error during handshake: {0}")]
    Link(String),
}

/// Failure to reach a peer through any of its known addresses.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// Every known address failed.
    #[error("Peer {peer} unreachable after {attempts} attempt(s): {last_error}")]
    Unreachable {
        peer: PeerId,
        attempts: usize,
        last_error: String,
    },

    /// The record carried no addresses at all.
    #[error("No known addresses for peer {0}")]
    NoAddresses(PeerId),

    /// A single address could not be dialed.
    #[error("Dial to {addr} failed: {reason}")]
    Address { addr: PeerAddr, reason: String },
}

/// A frame or payload that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// JSON decoding failed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is structurally invalid.
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// The frame exceeds the size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Failure to publish a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The router has been shut down.
    #[error("Router is shut down")]
    Shutdown,

    /// The topic name is empty.
    #[error("Topic must not be empty")]
    EmptyTopic,

    /// The payload exceeds the gossip size limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Multiplexer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    /// The stream was closed by either side.
    #[error("Stream {0} closed")]
    StreamClosed(u32),

    /// The underlying connection is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A single write exceeds the per-frame limit.
    #[error("Frame of {0} bytes exceeds stream limit")]
    FrameTooLarge(usize),
}

/// Errors that can occur in the disasternet_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A link-level error (TCP / WebSocket connect, send, receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Secure channel establishment failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Dialing a peer failed.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// A received frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Publishing failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Multiplexer failure.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption or decryption of a frame failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
