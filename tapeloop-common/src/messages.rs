//! Chat message types exchanged with the messaging collaborator
//!
//! Messages are small tagged structures rather than free-form payloads so
//! that the approval gateway has exactly one place that interprets text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reply received from the chat transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Raw message text as typed by the user
    pub text: String,
    /// Transport-specific sender identity
    pub sender: String,
    /// When the transport received the message
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Reference of the notification this message replies to, when the
    /// transport supports threaded replies
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

impl InboundMessage {
    pub fn new(text: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            in_reply_to: None,
        }
    }

    /// Mark this message as a threaded reply to `reference`
    pub fn replying_to(mut self, reference: impl Into<String>) -> Self {
        self.in_reply_to = Some(reference.into());
        self
    }
}

/// What an outbound notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// "Found new song, reply yes or no"
    ApprovalRequest,
    /// Confirmation that an approval was accepted
    ApprovalAck,
    /// Confirmation that a track was skipped
    Rejected,
    /// A recording finished and is queued for the player
    Recorded,
    /// A track exhausted its retries
    Abandoned,
    /// Retries crossed the visibility threshold
    RetryWarning,
    /// One sync pass finished
    SyncComplete,
}

/// A notification sent through the messaging collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_deserializes_without_optional_fields() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"text":"yes","sender":"alice"}"#).unwrap();
        assert_eq!(msg.text, "yes");
        assert_eq!(msg.sender, "alice");
        assert!(msg.in_reply_to.is_none());
    }

    #[test]
    fn test_message_kind_serializes_snake_case() {
        let json = serde_json::to_string(&MessageKind::SyncComplete).unwrap();
        assert_eq!(json, "\"sync_complete\"");
    }
}
