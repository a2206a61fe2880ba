//! Chat error types.

use disasternet_network::PublishError;

/// Errors surfaced to callers of the chat API.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The outgoing message was rejected before sending.
    #[error("Invalid message: {0}")]
    Validation(String),

    /// `send_message` was called before joining the room.
    #[error("Not joined to room '{0}'")]
    NotJoined(String),

    /// The router refused the message.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
