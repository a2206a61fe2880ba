//! Chat message wire record.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One chat message as sent over the wire.
///
/// Encoded as JSON `{id, sender, senderId, message, timestamp}`. Unknown
/// fields are ignored when decoding; missing ones are an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `<unix millis>-<senderId>-<counter>`.
    pub id: String,
    /// Sender nickname.
    pub sender: String,
    /// Short peer id of the sender.
    #[serde(rename = "senderId")]
    pub sender_id: String,
    /// Message body.
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a message stamped with the current time.
    pub fn new(sender: &str, sender_id: &str, body: &str, counter: u64) -> Self {
        let timestamp = Utc::now().trunc_subsecs(3);
        Self {
            id: format!("{}-{sender_id}-{counter}", timestamp.timestamp_millis()),
            sender: sender.to_string(),
            sender_id: sender_id.to_string(),
            message: body.to_string(),
            timestamp,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Transcript form: `[timestamp] sender: message`.
    pub fn log_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            self.sender,
            self.message
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
