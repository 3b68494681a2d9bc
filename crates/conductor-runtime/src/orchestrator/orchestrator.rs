//! Orchestrator: multi-conversation coordinator.
//!
//! Owns the session registry, message queue, approval broker, and progress
//! emitter, and tracks one spawned task per conversation. Every run and every
//! drain happens inside a conversation task that holds the conversation's
//! processing token, so at most one run is in flight per conversation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conductor_core::history::ConversationHistory;
use conductor_core::ids::{ApprovalId, ConversationId, MessageId, SessionId};
use conductor_core::messages::TranscriptEntry;
use conductor_core::model::ModelClient;
use conductor_core::progress::{ProgressSink, ProgressSnapshot};
use conductor_core::text::title_from_text;
use conductor_core::tools::ToolExecutor;
use conductor_settings::ConductorSettings;
use futures::future::join_all;
use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::event_emitter::ProgressEmitter;
use crate::agent::run_loop::{RunContext, run_session};
use crate::approval::{ApprovalBroker, ApprovalRequest};
use crate::errors::RuntimeError;
use crate::orchestrator::drain::{DrainStop, drain_queue};
use crate::queue::{MessageQueue, ProcessingGuard, QueuedMessage};
use crate::session::{Session, SessionRegistry};
use crate::types::{RunConfig, TaskRequest, TaskStart};

/// External backends the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Language model.
    pub model: Arc<dyn ModelClient>,
    /// Tool execution.
    pub tools: Arc<dyn ToolExecutor>,
    /// Conversation turn store.
    pub history: Arc<dyn ConversationHistory>,
}

struct Shared {
    ctx: RunContext,
    queue: MessageQueue,
    emitter: Arc<ProgressEmitter>,
    /// Conversation tasks, keyed by conversation. Finished handles are pruned
    /// on insert.
    tasks: Mutex<HashMap<ConversationId, JoinHandle<()>>>,
    /// Signalled whenever a processing token is given back outside the queue
    /// hand-off: a conversation task ending or a start that failed.
    idle: Notify,
    shutting_down: AtomicBool,
}

/// Multi-conversation orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator over `collaborators`.
    pub fn new(collaborators: Collaborators, config: RunConfig) -> Self {
        let emitter = ProgressEmitter::with_capacity(config.progress_capacity);
        Self::build(collaborators, config, emitter)
    }

    /// Create an orchestrator that also forwards every snapshot to `sink`.
    pub fn with_progress_sink(
        collaborators: Collaborators,
        config: RunConfig,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let emitter = ProgressEmitter::with_capacity(config.progress_capacity).with_forward(sink);
        Self::build(collaborators, config, emitter)
    }

    /// Create an orchestrator configured from loaded settings.
    pub fn from_settings(collaborators: Collaborators, settings: &ConductorSettings) -> Self {
        Self::new(collaborators, RunConfig::from(settings))
    }

    fn build(collaborators: Collaborators, config: RunConfig, emitter: ProgressEmitter) -> Self {
        let emitter = Arc::new(emitter);
        let ctx = RunContext {
            registry: Arc::new(SessionRegistry::new(config.max_iterations)),
            broker: Arc::new(ApprovalBroker::new()),
            model: collaborators.model,
            tools: collaborators.tools,
            history: collaborators.history,
            progress: emitter.clone(),
            config,
        };
        Self {
            shared: Arc::new(Shared {
                ctx,
                queue: MessageQueue::new(),
                emitter,
                tasks: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────────────────

    /// Start a run for `request.text`, or queue it if the conversation is busy.
    ///
    /// The conversation's processing token decides: when it is free the text
    /// is appended to history and a run starts on the bound session (revived)
    /// or a new one; when it is held the text is queued and the bound session
    /// id, if any, is returned alongside the queued message id.
    #[instrument(skip_all, fields(conversation_id, session_id))]
    pub async fn start_or_resume_task(&self, request: TaskRequest) -> Result<TaskStart, RuntimeError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::Cancelled);
        }
        let registry = &self.shared.ctx.registry;

        // 1. Resolve the conversation
        let explicit = match &request.session_id {
            Some(id) => Some(
                registry
                    .get(id)
                    .ok_or_else(|| RuntimeError::SessionNotFound(id.clone()))?,
            ),
            None => None,
        };
        if let Some(session) = &explicit {
            ensure_not_moving_running(registry, session, request.conversation_id.as_ref())?;
        }
        let conversation_id = match request
            .conversation_id
            .clone()
            .or_else(|| explicit.as_ref().and_then(|s| s.conversation_id.clone()))
        {
            Some(id) => id,
            None => {
                let title = title_from_text(&request.text, self.shared.ctx.config.title_max_bytes);
                self.shared.ctx.history.create(&title).await?
            }
        };
        let _ = tracing::Span::current().record("conversation_id", conversation_id.as_str());

        // 2. Busy conversation: queue instead
        let Some(guard) = self.shared.queue.try_acquire_guard(&conversation_id) else {
            let message = self.shared.queue.enqueue(&conversation_id, &request.text);
            let _ = self.trigger_drain(&conversation_id);
            info!(message_id = %message.id, "conversation busy, message queued");
            return Ok(TaskStart {
                session_id: registry.find_by_conversation_id(&conversation_id),
                conversation_id,
                queued_message_id: Some(message.id),
            });
        };

        // 3. Record the turn and pick the session
        let session_id = match self
            .prepare_run(&request, &conversation_id, explicit.map(|s| s.id))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                drop(guard);
                self.shared.idle.notify_waiters();
                let _ = self.trigger_drain(&conversation_id);
                return Err(e);
            }
        };
        let _ = tracing::Span::current().record("session_id", session_id.as_str());

        // 4. Run, then drain, on a tracked task
        self.spawn_tracked(guard, Some((session_id.clone(), request.text)));
        info!("task started");
        Ok(TaskStart {
            session_id: Some(session_id),
            conversation_id,
            queued_message_id: None,
        })
    }

    async fn prepare_run(
        &self,
        request: &TaskRequest,
        conversation_id: &ConversationId,
        explicit: Option<SessionId>,
    ) -> Result<SessionId, RuntimeError> {
        let ctx = &self.shared.ctx;
        // Re-check under the token: the session may have started a run since.
        if let Some(session) = explicit.as_ref().and_then(|id| ctx.registry.get(id)) {
            ensure_not_moving_running(&ctx.registry, &session, Some(conversation_id))?;
        }
        ctx.history
            .append(conversation_id, TranscriptEntry::user(request.text.clone()))
            .await?;

        let existing = explicit.or_else(|| ctx.registry.find_by_conversation_id(conversation_id));
        if let Some(id) = existing {
            if ctx.registry.revive(&id, request.start_snoozed) {
                ctx.registry.bind_conversation(&id, conversation_id)?;
                debug!(session_id = %id, "session resumed");
                return Ok(id);
            }
        }
        let title = title_from_text(&request.text, ctx.config.title_max_bytes);
        Ok(ctx
            .registry
            .start(Some(conversation_id.clone()), &title, request.start_snoozed))
    }

    /// Drain `conversation_id` on a new task if it is idle and has work.
    ///
    /// Returns `true` if a drain task was started. Nothing starts once
    /// shutdown has begun.
    pub fn trigger_drain(&self, conversation_id: &ConversationId) -> bool {
        if self.shared.shutting_down.load(Ordering::SeqCst)
            || !self.shared.queue.has_drainable(conversation_id)
        {
            return false;
        }
        match self.shared.queue.try_acquire_guard(conversation_id) {
            Some(guard) => {
                self.spawn_tracked(guard, None);
                true
            }
            None => false,
        }
    }

    fn spawn_tracked(&self, guard: ProcessingGuard, initial: Option<(SessionId, String)>) {
        let conversation_id = guard.conversation_id().clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(conversation_task(shared, guard, initial));
        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(conversation_id, handle) {
            // Still winding down after releasing the token; it only exits.
            debug!(finished = previous.is_finished(), "conversation task replaced");
        }
        #[allow(clippy::cast_precision_loss)]
        gauge!("conductor_conversation_tasks").set(tasks.len() as f64);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session control
    // ─────────────────────────────────────────────────────────────────────

    /// Stop a session.
    ///
    /// Pending approvals for the session are denied before this returns. With
    /// `pause_on_stop`, the conversation's queue is paused so nothing drains
    /// until it is resumed. Returns `false` if the session had already finished.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn stop_session(&self, session_id: &SessionId) -> Result<bool, RuntimeError> {
        let session = self
            .shared
            .ctx
            .registry
            .get(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;

        // Pause first so a run that ends on the stop cannot start the next message.
        let paused = match &session.conversation_id {
            Some(conv)
                if self.shared.ctx.config.pause_on_stop
                    && session.status.is_live()
                    && !self.shared.queue.is_paused(conv) =>
            {
                self.shared.queue.pause(conv);
                Some(conv.clone())
            }
            _ => None,
        };

        let stopped = self.shared.ctx.registry.stop(session_id)?;
        let denied = self.shared.ctx.broker.cancel_session_approvals(session_id);

        // Already finished: undo the pause.
        if let Some(conv) = paused.filter(|_| !stopped) {
            self.shared.queue.resume(&conv);
            let _ = self.trigger_drain(&conv);
        }
        info!(stopped, denied, "stop requested");
        Ok(stopped)
    }

    /// Snooze a live session. It keeps running.
    pub fn snooze_session(&self, session_id: &SessionId) -> Result<(), RuntimeError> {
        self.shared.ctx.registry.snooze(session_id)
    }

    /// Bring a snoozed session back to active.
    pub fn unsnooze_session(&self, session_id: &SessionId) -> Result<(), RuntimeError> {
        self.shared.ctx.registry.unsnooze(session_id)
    }

    /// Deliver a human decision. `false` if the approval is unknown or already resolved.
    #[instrument(skip(self), fields(approval_id = %approval_id))]
    pub fn respond_to_approval(&self, approval_id: &ApprovalId, approved: bool) -> bool {
        self.shared.ctx.broker.respond(approval_id, approved)
    }

    /// Outstanding approvals for a session.
    pub fn pending_approvals(&self, session_id: &SessionId) -> Vec<ApprovalRequest> {
        self.shared.ctx.broker.pending(session_id)
    }

    /// Snapshot of a session.
    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.shared.ctx.registry.get(session_id)
    }

    /// Live sessions, most recently active first.
    pub fn list_active_sessions(&self) -> Vec<Session> {
        self.shared.ctx.registry.list_active()
    }

    /// Up to `limit` sessions of any status, most recently active first.
    pub fn list_recent_sessions(&self, limit: usize) -> Vec<Session> {
        self.shared.ctx.registry.list_recent(limit)
    }

    /// Forget finished sessions. Returns how many were dropped.
    pub fn clear_finished_sessions(&self) -> usize {
        self.shared.ctx.registry.clear_finished()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queue management
    // ─────────────────────────────────────────────────────────────────────

    /// Queue text for a conversation, draining right away if it is idle.
    #[instrument(skip(self, text), fields(conversation_id = %conversation_id))]
    pub fn enqueue(&self, conversation_id: &ConversationId, text: &str) -> QueuedMessage {
        let message = self.shared.queue.enqueue(conversation_id, text);
        let _ = self.trigger_drain(conversation_id);
        message
    }

    /// Drop a queued message that is not processing.
    pub fn remove_message(&self, message_id: &MessageId) -> Result<QueuedMessage, RuntimeError> {
        let removed = self.shared.queue.remove(message_id)?;
        let _ = self.trigger_drain(&removed.conversation_id);
        Ok(removed)
    }

    /// Reorder a conversation's queue.
    pub fn reorder_queue(
        &self,
        conversation_id: &ConversationId,
        order: &[MessageId],
    ) -> Result<(), RuntimeError> {
        self.shared.queue.reorder(conversation_id, order)?;
        let _ = self.trigger_drain(conversation_id);
        Ok(())
    }

    /// Drop every message that is not processing. Returns how many went.
    pub fn clear_queue(&self, conversation_id: &ConversationId) -> usize {
        self.shared.queue.clear(conversation_id)
    }

    /// Stop automatic draining for a conversation.
    pub fn pause_queue(&self, conversation_id: &ConversationId) {
        self.shared.queue.pause(conversation_id);
    }

    /// Resume automatic draining and drain now if idle.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn resume_queue(&self, conversation_id: &ConversationId) {
        self.shared.queue.resume(conversation_id);
        let _ = self.trigger_drain(conversation_id);
    }

    /// Put a failed message back to pending and drain now if idle.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub fn retry_failed(&self, message_id: &MessageId) -> Result<(), RuntimeError> {
        self.shared.queue.reset_to_pending(message_id)?;
        let message = self
            .shared
            .queue
            .get(message_id)
            .ok_or_else(|| RuntimeError::MessageNotFound(message_id.clone()))?;
        let _ = self.trigger_drain(&message.conversation_id);
        Ok(())
    }

    /// Edit a queued message that is not processing.
    pub fn update_message_text(
        &self,
        message_id: &MessageId,
        text: &str,
    ) -> Result<QueuedMessage, RuntimeError> {
        self.shared.queue.update_text(message_id, text)
    }

    /// Whether a conversation's draining is paused.
    pub fn is_queue_paused(&self, conversation_id: &ConversationId) -> bool {
        self.shared.queue.is_paused(conversation_id)
    }

    /// A conversation's queue, head first.
    pub fn get_queue(&self, conversation_id: &ConversationId) -> Vec<QueuedMessage> {
        self.shared.queue.list(conversation_id)
    }

    /// Every non-empty queue.
    pub fn get_all_queues(&self) -> HashMap<ConversationId, Vec<QueuedMessage>> {
        self.shared.queue.list_all()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────

    /// Receive every progress snapshot published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.shared.emitter.subscribe()
    }

    /// The progress emitter.
    pub fn emitter(&self) -> &Arc<ProgressEmitter> {
        &self.shared.emitter
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.ctx.registry
    }

    /// The message queue.
    pub fn queue(&self) -> &MessageQueue {
        &self.shared.queue
    }

    /// Run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.shared.ctx.config
    }

    /// Runs in flight right now.
    pub fn active_run_count(&self) -> usize {
        self.shared.ctx.registry.running_count()
    }

    /// Wait until the conversation has no task and its token is free.
    pub async fn wait_for_conversation(&self, conversation_id: &ConversationId) {
        loop {
            let handle = self.shared.tasks.lock().remove(conversation_id);
            match handle {
                Some(handle) => {
                    if let Err(e) = handle.await {
                        error!(conversation_id = %conversation_id, error = %e, "conversation task panicked");
                    }
                }
                None => {
                    // Another waiter may hold the handle; wait for the token.
                    let notified = self.shared.idle.notified();
                    tokio::pin!(notified);
                    let _ = notified.as_mut().enable();
                    if !self.shared.queue.is_locked(conversation_id) {
                        return;
                    }
                    notified.await;
                }
            }
        }
    }

    /// Wait until every tracked conversation is idle.
    pub async fn wait_idle(&self) {
        loop {
            let conversations: Vec<ConversationId> =
                self.shared.tasks.lock().keys().cloned().collect();
            if conversations.is_empty() {
                return;
            }
            let _ = join_all(
                conversations
                    .iter()
                    .map(|conversation_id| self.wait_for_conversation(conversation_id)),
            )
            .await;
        }
    }

    /// Graceful shutdown.
    ///
    /// Stops every live session, pauses every tracked conversation, denies
    /// every outstanding approval, and waits for the conversation tasks to
    /// wind down. Nothing is aborted mid-effect. New tasks are refused after.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("orchestrator shutdown initiated");
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let tracked: Vec<ConversationId> = self.shared.tasks.lock().keys().cloned().collect();
        for conversation_id in &tracked {
            self.shared.queue.pause(conversation_id);
        }

        let live = self.shared.ctx.registry.list_active();
        for session in &live {
            if let Err(e) = self.stop_session(&session.id) {
                warn!(session_id = %session.id, error = %e, "failed to stop session during shutdown");
            }
        }

        let denied = self.shared.ctx.broker.cancel_all();
        self.wait_idle().await;
        info!(stopped = live.len(), denied, "orchestrator shutdown complete");
    }
}

/// Body of a conversation task: optionally run a session, then drain until
/// the queue has nothing runnable. Re-checks after giving the token back so
/// a message queued during the hand-off is not stranded.
async fn conversation_task(
    shared: Arc<Shared>,
    mut guard: ProcessingGuard,
    initial: Option<(SessionId, String)>,
) {
    let conversation_id = guard.conversation_id().clone();

    if let Some((session_id, prompt)) = initial {
        match run_session(&shared.ctx, &session_id, &prompt).await {
            Ok(result) => debug!(%session_id, outcome = %result.outcome, "direct run finished"),
            Err(e) => warn!(%session_id, error = %e, "direct run failed"),
        }
    }

    loop {
        let report = drain_queue(&shared.ctx, &shared.queue, &guard).await;
        drop(guard);
        if report.stop == DrainStop::Failed
            || shared.shutting_down.load(Ordering::SeqCst)
            || !shared.queue.has_drainable(&conversation_id)
        {
            break;
        }
        match shared.queue.try_acquire_guard(&conversation_id) {
            Some(next) => guard = next,
            None => break,
        }
    }
    shared.idle.notify_waiters();
    debug!(conversation_id = %conversation_id, "conversation idle");
}

/// Refuse to pull a session with a run in flight into another conversation.
///
/// `target` is the requested conversation; `None` keeps the session's own.
fn ensure_not_moving_running(
    registry: &SessionRegistry,
    session: &Session,
    target: Option<&ConversationId>,
) -> Result<(), RuntimeError> {
    let moving = match (target, &session.conversation_id) {
        (Some(target), Some(bound)) => target != bound,
        (_, None) => true,
        (None, Some(_)) => false,
    };
    if moving && registry.is_running(&session.id) {
        warn!(session_id = %session.id, "session is running in another conversation");
        return Err(RuntimeError::SessionBusy(session.id.clone()));
    }
    Ok(())
}
