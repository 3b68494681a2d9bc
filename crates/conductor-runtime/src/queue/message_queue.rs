//! Per-conversation message queue with a processing token.
//!
//! Each conversation has an ordered list of messages, a paused flag, and a
//! compare-and-set processing flag. Whoever holds the flag is the only one
//! allowed to claim messages (`mark_processing`) or run the conversation.
//! Contention is a plain `false`/`None`, never a wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conductor_core::ids::{ConversationId, MessageId};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::errors::RuntimeError;
use crate::queue::types::{MessageStatus, QueuedMessage};

#[derive(Default)]
struct ConversationQueue {
    messages: Vec<QueuedMessage>,
    paused: bool,
}

impl ConversationQueue {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }
}

#[derive(Default)]
struct QueueEntry {
    inner: Mutex<ConversationQueue>,
    processing: AtomicBool,
}

/// RAII ownership of a conversation's processing token.
///
/// Released on drop, including during a panic unwind.
pub struct ProcessingGuard {
    entry: Arc<QueueEntry>,
    conversation_id: ConversationId,
}

impl ProcessingGuard {
    /// Conversation this guard locks.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.entry.processing.store(false, Ordering::SeqCst);
        debug!(conversation_id = %self.conversation_id, "processing lock released");
    }
}

impl std::fmt::Debug for ProcessingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingGuard")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

/// Ordered pending messages for every conversation.
#[derive(Default)]
pub struct MessageQueue {
    queues: DashMap<ConversationId, Arc<QueueEntry>>,
    /// Which conversation each queued message lives in.
    index: DashMap<MessageId, ConversationId>,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the end of a conversation's queue.
    #[instrument(skip(self, text))]
    pub fn enqueue(&self, conversation_id: &ConversationId, text: &str) -> QueuedMessage {
        let message = QueuedMessage::new(conversation_id.clone(), text.to_owned());
        let entry = self.entry(conversation_id);
        {
            let mut queue = entry.inner.lock();
            queue.messages.push(message.clone());
        }
        let _ = self
            .index
            .insert(message.id.clone(), conversation_id.clone());
        counter!("conductor_messages_enqueued_total").increment(1);
        self.update_depth();
        debug!(message_id = %message.id, "message enqueued");
        message
    }

    /// Head of the queue if it is waiting to be drained.
    ///
    /// Returns `None` for an empty queue and also when the head is processing
    /// or failed, so a failed message blocks the ones behind it.
    pub fn peek(&self, conversation_id: &ConversationId) -> Option<QueuedMessage> {
        let entry = self.existing(conversation_id)?;
        let queue = entry.inner.lock();
        queue
            .messages
            .first()
            .filter(|m| m.status == MessageStatus::Pending)
            .cloned()
    }

    /// Whether a drain started now would have something to do.
    pub fn has_drainable(&self, conversation_id: &ConversationId) -> bool {
        !self.is_paused(conversation_id) && self.peek(conversation_id).is_some()
    }

    /// Claim `expected` for processing.
    ///
    /// Only succeeds while the processing token is held and the message is
    /// still the pending head with the same revision and text it had when it
    /// was peeked.
    pub fn mark_processing(&self, conversation_id: &ConversationId, expected: &QueuedMessage) -> bool {
        let Some(entry) = self.existing(conversation_id) else {
            return false;
        };
        if !entry.processing.load(Ordering::SeqCst) {
            warn!(conversation_id = %conversation_id, "mark_processing without the processing lock");
            return false;
        }
        let mut queue = entry.inner.lock();
        match queue.messages.first_mut() {
            Some(head) if head.matches(expected) => {
                head.status = MessageStatus::Processing;
                debug!(message_id = %head.id, "message processing");
                true
            }
            _ => {
                debug!(message_id = %expected.id, "message changed since peek");
                false
            }
        }
    }

    /// Remove a processing message after a successful run.
    pub fn mark_processed(&self, id: &MessageId) -> Result<QueuedMessage, RuntimeError> {
        let removed = self.with_message(id, |queue, pos| {
            expect_status(&queue.messages[pos], MessageStatus::Processing)?;
            Ok(queue.messages.remove(pos))
        })?;
        let _ = self.index.remove(id);
        counter!("conductor_messages_processed_total").increment(1);
        self.update_depth();
        debug!(message_id = %id, "message processed");
        Ok(removed)
    }

    /// Keep a processing message in the queue as failed.
    pub fn mark_failed(&self, id: &MessageId, error: &str) -> Result<(), RuntimeError> {
        self.with_message(id, |queue, pos| {
            let msg = &mut queue.messages[pos];
            expect_status(msg, MessageStatus::Processing)?;
            msg.status = MessageStatus::Failed;
            msg.last_error = Some(error.to_owned());
            Ok(())
        })?;
        counter!("conductor_messages_failed_total").increment(1);
        warn!(message_id = %id, error, "message failed");
        Ok(())
    }

    /// Record that the text is in conversation history.
    ///
    /// Returns `false` if it already was.
    pub fn mark_added_to_history(&self, id: &MessageId) -> Result<bool, RuntimeError> {
        self.with_message(id, |queue, pos| {
            let msg = &mut queue.messages[pos];
            let newly = !msg.added_to_history;
            msg.added_to_history = true;
            Ok(newly)
        })
    }

    /// Make a failed message pending again. Text and history flag are kept.
    pub fn reset_to_pending(&self, id: &MessageId) -> Result<(), RuntimeError> {
        self.with_message(id, |queue, pos| {
            let msg = &mut queue.messages[pos];
            expect_status(msg, MessageStatus::Failed)?;
            msg.status = MessageStatus::Pending;
            msg.last_error = None;
            Ok(())
        })?;
        debug!(message_id = %id, "message reset to pending");
        Ok(())
    }

    /// Replace a message's text. Not allowed while it is processing.
    pub fn update_text(&self, id: &MessageId, text: &str) -> Result<QueuedMessage, RuntimeError> {
        self.with_message(id, |queue, pos| {
            let msg = &mut queue.messages[pos];
            if msg.status == MessageStatus::Processing {
                return Err(RuntimeError::MessageBusy(msg.id.clone()));
            }
            text.clone_into(&mut msg.text);
            msg.revision += 1;
            Ok(msg.clone())
        })
    }

    /// Remove a message. Not allowed while it is processing.
    pub fn remove(&self, id: &MessageId) -> Result<QueuedMessage, RuntimeError> {
        let removed = self.with_message(id, |queue, pos| {
            if queue.messages[pos].status == MessageStatus::Processing {
                return Err(RuntimeError::MessageBusy(id.clone()));
            }
            Ok(queue.messages.remove(pos))
        })?;
        let _ = self.index.remove(id);
        self.update_depth();
        debug!(message_id = %id, "message removed");
        Ok(removed)
    }

    /// Reorder a conversation's queue.
    ///
    /// Listed messages move to the front in the given order; unlisted ones
    /// follow in their current order. A processing message always stays first.
    pub fn reorder(&self, conversation_id: &ConversationId, ids: &[MessageId]) -> Result<(), RuntimeError> {
        let Some(entry) = self.existing(conversation_id) else {
            return match ids.first() {
                Some(first) => Err(RuntimeError::NotInQueue {
                    conversation_id: conversation_id.clone(),
                    message_id: first.clone(),
                }),
                None => Ok(()),
            };
        };
        let mut queue = entry.inner.lock();
        if let Some(missing) = ids.iter().find(|id| queue.position(id).is_none()) {
            return Err(RuntimeError::NotInQueue {
                conversation_id: conversation_id.clone(),
                message_id: missing.clone(),
            });
        }

        let mut rest = std::mem::take(&mut queue.messages);
        let mut ordered = Vec::with_capacity(rest.len());
        if let Some(pos) = rest.iter().position(|m| m.status == MessageStatus::Processing) {
            ordered.push(rest.remove(pos));
        }
        for id in ids {
            if let Some(pos) = rest.iter().position(|m| &m.id == id) {
                ordered.push(rest.remove(pos));
            }
        }
        ordered.extend(rest);
        queue.messages = ordered;
        debug!(conversation_id = %conversation_id, "queue reordered");
        Ok(())
    }

    /// Drop every message except one in flight. Returns how many were removed.
    pub fn clear(&self, conversation_id: &ConversationId) -> usize {
        let Some(entry) = self.existing(conversation_id) else {
            return 0;
        };
        let removed: Vec<MessageId> = {
            let mut queue = entry.inner.lock();
            let (keep, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.messages)
                .into_iter()
                .partition(|m| m.status == MessageStatus::Processing);
            queue.messages = keep;
            dropped.into_iter().map(|m| m.id).collect()
        };
        for id in &removed {
            let _ = self.index.remove(id);
        }
        self.update_depth();
        debug!(conversation_id = %conversation_id, removed = removed.len(), "queue cleared");
        removed.len()
    }

    /// Stop automatic draining for a conversation.
    pub fn pause(&self, conversation_id: &ConversationId) {
        self.entry(conversation_id).inner.lock().paused = true;
        debug!(conversation_id = %conversation_id, "queue paused");
    }

    /// Allow automatic draining again.
    pub fn resume(&self, conversation_id: &ConversationId) {
        if let Some(entry) = self.existing(conversation_id) {
            entry.inner.lock().paused = false;
            debug!(conversation_id = %conversation_id, "queue resumed");
        }
    }

    /// Whether draining is paused.
    pub fn is_paused(&self, conversation_id: &ConversationId) -> bool {
        self.existing(conversation_id)
            .is_some_and(|e| e.inner.lock().paused)
    }

    /// Take the processing token. `false` if someone already holds it.
    pub fn try_acquire_lock(&self, conversation_id: &ConversationId) -> bool {
        self.entry(conversation_id)
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Give the processing token back.
    pub fn release_lock(&self, conversation_id: &ConversationId) {
        if let Some(entry) = self.existing(conversation_id) {
            entry.processing.store(false, Ordering::SeqCst);
        }
    }

    /// Take the processing token as a guard that releases it on drop.
    pub fn try_acquire_guard(&self, conversation_id: &ConversationId) -> Option<ProcessingGuard> {
        let entry = self.entry(conversation_id);
        entry
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        debug!(conversation_id = %conversation_id, "processing lock acquired");
        Some(ProcessingGuard {
            entry,
            conversation_id: conversation_id.clone(),
        })
    }

    /// Whether the processing token is held.
    pub fn is_locked(&self, conversation_id: &ConversationId) -> bool {
        self.existing(conversation_id)
            .is_some_and(|e| e.processing.load(Ordering::SeqCst))
    }

    /// Snapshot of one message.
    pub fn get(&self, id: &MessageId) -> Option<QueuedMessage> {
        self.with_message(id, |queue, pos| Ok(queue.messages[pos].clone()))
            .ok()
    }

    /// Snapshot of a conversation's queue, head first.
    pub fn list(&self, conversation_id: &ConversationId) -> Vec<QueuedMessage> {
        self.existing(conversation_id)
            .map(|e| e.inner.lock().messages.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every non-empty queue.
    pub fn list_all(&self) -> HashMap<ConversationId, Vec<QueuedMessage>> {
        self.handles()
            .into_iter()
            .filter_map(|(conv, entry)| {
                let messages = entry.inner.lock().messages.clone();
                (!messages.is_empty()).then_some((conv, messages))
            })
            .collect()
    }

    /// Total queued messages across conversations.
    pub fn depth(&self) -> usize {
        self.index.len()
    }

    fn entry(&self, conversation_id: &ConversationId) -> Arc<QueueEntry> {
        Arc::clone(
            self.queues
                .entry(conversation_id.clone())
                .or_default()
                .value(),
        )
    }

    fn existing(&self, conversation_id: &ConversationId) -> Option<Arc<QueueEntry>> {
        self.queues.get(conversation_id).map(|e| Arc::clone(e.value()))
    }

    fn handles(&self) -> Vec<(ConversationId, Arc<QueueEntry>)> {
        self.queues
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn with_message<R>(
        &self,
        id: &MessageId,
        f: impl FnOnce(&mut ConversationQueue, usize) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let not_found = || RuntimeError::MessageNotFound(id.clone());
        let conversation_id = self
            .index
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(not_found)?;
        let entry = self.existing(&conversation_id).ok_or_else(not_found)?;
        let mut queue = entry.inner.lock();
        let pos = queue.position(id).ok_or_else(not_found)?;
        f(&mut *queue, pos)
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_depth(&self) {
        gauge!("conductor_queue_depth").set(self.index.len() as f64);
    }
}

fn expect_status(msg: &QueuedMessage, expected: MessageStatus) -> Result<(), RuntimeError> {
    if msg.status == expected {
        Ok(())
    } else {
        Err(RuntimeError::InvalidMessageState {
            id: msg.id.clone(),
            expected,
            actual: msg.status,
        })
    }
}
