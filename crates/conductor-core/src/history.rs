//! Conversation history boundary.
//!
//! Conversations are owned outside the engine and referenced by ID only.
//! The runtime reads a conversation to seed a run's transcript and appends
//! user turns (from the queue) and final answers to it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::ids::ConversationId;
use crate::messages::TranscriptEntry;

/// Failure talking to the history backend.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Backend unavailable or rejected the operation.
    #[error("history backend error: {0}")]
    Backend(String),
}

/// Externally owned, ordered turn history.
#[async_trait]
pub trait ConversationHistory: Send + Sync {
    /// Create a new conversation and return its ID.
    async fn create(&self, title: &str) -> Result<ConversationId, HistoryError>;

    /// Load every entry of a conversation, oldest first.
    async fn load(&self, conversation_id: &ConversationId)
    -> Result<Vec<TranscriptEntry>, HistoryError>;

    /// Append an entry to a conversation.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        entry: TranscriptEntry,
    ) -> Result<(), HistoryError>;
}

#[derive(Default)]
struct StoredConversation {
    title: String,
    entries: Vec<TranscriptEntry>,
}

/// Process-local history store.
///
/// Unknown conversation IDs are created lazily on first append and load as
/// empty, so externally supplied IDs work without a prior `create`.
#[derive(Default)]
pub struct InMemoryHistory {
    conversations: Mutex<HashMap<ConversationId, StoredConversation>>,
}

impl InMemoryHistory {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Title a conversation was created with.
    pub fn title(&self, conversation_id: &ConversationId) -> Option<String> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|c| c.title.clone())
    }

    /// Snapshot of a conversation's entries.
    pub fn entries(&self, conversation_id: &ConversationId) -> Vec<TranscriptEntry> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|c| c.entries.clone())
            .unwrap_or_default()
    }

    /// Texts of the user entries, in order.
    pub fn user_texts(&self, conversation_id: &ConversationId) -> Vec<String> {
        self.entries(conversation_id)
            .into_iter()
            .filter_map(|e| match e {
                TranscriptEntry::User { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ConversationHistory for InMemoryHistory {
    async fn create(&self, title: &str) -> Result<ConversationId, HistoryError> {
        let id = ConversationId::new();
        let _ = self.conversations.lock().insert(
            id.clone(),
            StoredConversation {
                title: title.to_owned(),
                entries: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn load(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<TranscriptEntry>, HistoryError> {
        Ok(self.entries(conversation_id))
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        entry: TranscriptEntry,
    ) -> Result<(), HistoryError> {
        self.conversations
            .lock()
            .entry(conversation_id.clone())
            .or_default()
            .entries
            .push(entry);
        Ok(())
    }
}
