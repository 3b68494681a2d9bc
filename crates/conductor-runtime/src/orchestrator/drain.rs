//! Queue drain: consume a conversation's pending messages one at a time
//! while holding its processing token.

use conductor_core::ids::{ConversationId, SessionId};
use conductor_core::messages::TranscriptEntry;
use conductor_core::text::title_from_text;
use tracing::{debug, info, instrument, warn};

use crate::agent::run_loop::{RunContext, run_session};
use crate::errors::RuntimeError;
use crate::queue::{MessageQueue, ProcessingGuard, QueuedMessage};
use crate::session::SessionStatus;
use crate::types::RunResult;

/// Consecutive `mark_processing` misses tolerated before giving up the token.
const MAX_CLAIM_MISSES: u32 = 16;

/// Why a drain pass stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainStop {
    /// Nothing left.
    Empty,
    /// A failed message sits at the head.
    Blocked,
    /// The queue was paused.
    Paused,
    /// A message's run errored; it stays in the queue as failed.
    Failed,
    /// Messages kept changing under the claim.
    Contended,
}

/// Summary of one drain pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages run and removed.
    pub processed: usize,
    /// Messages marked failed.
    pub failed: usize,
    /// Why the pass ended.
    pub stop: DrainStop,
}

/// Drain the conversation `guard` holds the token for.
///
/// Returns when the queue is empty, blocked by a failed head, paused, or a
/// run fails. The guard is not released here.
#[instrument(skip_all, fields(conversation_id = %guard.conversation_id()))]
pub async fn drain_queue(
    ctx: &RunContext,
    queue: &MessageQueue,
    guard: &ProcessingGuard,
) -> DrainReport {
    let conversation_id = guard.conversation_id();
    let mut processed = 0;
    let mut misses = 0;

    let stop = loop {
        if queue.is_paused(conversation_id) {
            break DrainStop::Paused;
        }
        let Some(next) = queue.peek(conversation_id) else {
            break if queue.list(conversation_id).is_empty() {
                DrainStop::Empty
            } else {
                DrainStop::Blocked
            };
        };
        if !queue.mark_processing(conversation_id, &next) {
            misses += 1;
            if misses >= MAX_CLAIM_MISSES {
                warn!(misses, "giving up on a contended queue");
                break DrainStop::Contended;
            }
            continue;
        }
        misses = 0;

        match process_message(ctx, queue, &next).await {
            Ok(result) => {
                if let Err(e) = queue.mark_processed(&next.id) {
                    warn!(message_id = %next.id, error = %e, "processed message vanished");
                }
                processed += 1;
                debug!(message_id = %next.id, outcome = %result.outcome, "queued message done");
            }
            Err(e) => {
                warn!(message_id = %next.id, error = %e, "queued message failed");
                if let Err(mark) = queue.mark_failed(&next.id, &e.to_string()) {
                    warn!(message_id = %next.id, error = %mark, "could not mark message failed");
                }
                return DrainReport {
                    processed,
                    failed: 1,
                    stop: DrainStop::Failed,
                };
            }
        }
    };

    info!(processed, ?stop, "drain finished");
    DrainReport {
        processed,
        failed: 0,
        stop,
    }
}

/// Run one claimed message: record it in history once, pick its session,
/// and run the loop.
async fn process_message(
    ctx: &RunContext,
    queue: &MessageQueue,
    message: &QueuedMessage,
) -> Result<RunResult, RuntimeError> {
    let conversation_id = &message.conversation_id;
    if !message.added_to_history {
        ctx.history
            .append(conversation_id, TranscriptEntry::user(message.text.clone()))
            .await?;
        let _ = queue.mark_added_to_history(&message.id)?;
    }
    let session_id = resolve_session(ctx, conversation_id, &message.text);
    run_session(ctx, &session_id, &message.text).await
}

/// The conversation's bound session revived, or a new one.
///
/// A snoozed session stays snoozed.
pub(crate) fn resolve_session(
    ctx: &RunContext,
    conversation_id: &ConversationId,
    text: &str,
) -> SessionId {
    if let Some(id) = ctx.registry.find_by_conversation_id(conversation_id) {
        let snoozed = ctx
            .registry
            .get(&id)
            .is_some_and(|s| s.status == SessionStatus::Snoozed);
        if ctx.registry.revive(&id, snoozed) {
            return id;
        }
    }
    let title = title_from_text(text, ctx.config.title_max_bytes);
    ctx.registry
        .start(Some(conversation_id.clone()), &title, false)
}
