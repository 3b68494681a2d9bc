//! Queued message types.

use std::fmt;

use chrono::{DateTime, Utc};
use conductor_core::ids::{ConversationId, MessageId};
use serde::{Deserialize, Serialize};

/// Status of a queued message. Processed messages leave the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting to be drained.
    Pending,
    /// Claimed by a drain loop.
    Processing,
    /// Its run errored. Stays until retried or removed.
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A user message waiting for its conversation to become free.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Message ID.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Message text.
    pub text: String,
    /// Current status.
    pub status: MessageStatus,
    /// Whether the text was already appended to conversation history.
    pub added_to_history: bool,
    /// Bumped on every text edit.
    pub revision: u64,
    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,
    /// Error from the last failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedMessage {
    pub(crate) fn new(conversation_id: ConversationId, text: String) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            text,
            status: MessageStatus::Pending,
            added_to_history: false,
            revision: 0,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    /// Whether `self` is still the message that was observed as `expected`.
    pub(crate) fn matches(&self, expected: &Self) -> bool {
        self.id == expected.id
            && self.status == MessageStatus::Pending
            && self.revision == expected.revision
            && self.text == expected.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_pending() {
        let msg = QueuedMessage::new(ConversationId::from("conv_1"), "hello".into());
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(!msg.added_to_history);
        assert_eq!(msg.revision, 0);
        assert!(msg.id.as_str().starts_with("msg_"));
    }

    #[test]
    fn matches_detects_edits() {
        let msg = QueuedMessage::new(ConversationId::from("conv_1"), "hello".into());
        let seen = msg.clone();
        assert!(msg.matches(&seen));

        let mut edited = msg.clone();
        edited.revision += 1;
        assert!(!edited.matches(&seen));

        let mut failed = msg;
        failed.status = MessageStatus::Failed;
        assert!(!failed.matches(&seen));
    }

    #[test]
    fn wire_format() {
        let msg = QueuedMessage::new(ConversationId::from("conv_1"), "hi".into());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["conversationId"], "conv_1");
        assert_eq!(value["addedToHistory"], false);
        assert!(value.get("lastError").is_none());
    }
}
