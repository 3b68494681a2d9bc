//! Orchestration loop. Drives one session from its first model call to a
//! terminal state.
//!
//! INIT_TOOLS → ITERATE → {COMPLETE, COMPLETE_PARTIAL, ERROR, STOPPED}
//!
//! Each iteration: stop check → budget check → model call (raced against
//! the session's cancellation token) → stop check → either finish on a final
//! answer, or gate and execute every requested tool call in order, then count
//! the iteration and publish progress.

use std::sync::Arc;

use conductor_core::history::ConversationHistory;
use conductor_core::ids::{ConversationId, SessionId};
use conductor_core::messages::TranscriptEntry;
use conductor_core::model::{ModelClient, ModelResponse};
use conductor_core::progress::{ProgressSink, RunPhase};
use conductor_core::tools::ToolExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::progress::ProgressTracker;
use crate::agent::tool_gate::{self, GateOutcome};
use crate::approval::ApprovalBroker;
use crate::errors::RuntimeError;
use crate::session::SessionRegistry;
use crate::types::{RunConfig, RunOutcome, RunResult};

/// Everything a run needs, shared by every run of an orchestrator.
#[derive(Clone)]
pub struct RunContext {
    /// Session records.
    pub registry: Arc<SessionRegistry>,
    /// Approval correlation.
    pub broker: Arc<ApprovalBroker>,
    /// Model backend.
    pub model: Arc<dyn ModelClient>,
    /// Tool backend.
    pub tools: Arc<dyn ToolExecutor>,
    /// Conversation store.
    pub history: Arc<dyn ConversationHistory>,
    /// Where snapshots go.
    pub progress: Arc<dyn ProgressSink>,
    /// Run policy.
    pub config: RunConfig,
}

/// Run the orchestration loop for a session until it reaches a terminal state.
///
/// When the session is bound to a conversation, the transcript is seeded
/// from that conversation's history and `prompt` is expected to be its last
/// user turn already; it is only added in memory if it is missing. An
/// unbound session starts from `prompt` alone.
///
/// Returns `Ok` for completed, partial, and stopped runs. A model-call
/// failure, fatal tool failure, or history failure marks the session errored,
/// publishes an errored snapshot, and is returned as `Err`.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn run_session(
    ctx: &RunContext,
    session_id: &SessionId,
    prompt: &str,
) -> Result<RunResult, RuntimeError> {
    let _run = ctx.registry.begin_run(session_id)?;
    let session = ctx
        .registry
        .get(session_id)
        .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;
    let cancel = ctx
        .registry
        .cancellation(session_id)
        .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;

    let mut run = Run {
        ctx,
        session_id,
        conversation_id: session.conversation_id.clone(),
        tracker: Arc::new(ProgressTracker::new(
            session_id.clone(),
            session.conversation_id,
            session.max_iterations,
            Arc::clone(&ctx.progress),
        )),
        cancel,
        iteration: session.iteration_count,
        max_iterations: session.max_iterations,
    };
    info!(max_iterations = run.max_iterations, "run started");

    match run.drive(prompt).await {
        Ok(result) => {
            info!(outcome = %result.outcome, iterations = result.iterations, "run finished");
            Ok(result)
        }
        Err(e) => {
            run.fail(&e);
            Err(e)
        }
    }
}

struct Run<'a> {
    ctx: &'a RunContext,
    session_id: &'a SessionId,
    conversation_id: Option<ConversationId>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    iteration: u32,
    max_iterations: u32,
}

impl Run<'_> {
    async fn drive(&mut self, prompt: &str) -> Result<RunResult, RuntimeError> {
        // INIT_TOOLS
        let schema = self.ctx.tools.schema();
        let mut transcript = match &self.conversation_id {
            Some(conv) => self.ctx.history.load(conv).await?,
            None => Vec::new(),
        };
        let last_user = transcript.iter().rev().find_map(|e| match e {
            TranscriptEntry::User { text, .. } => Some(text.as_str()),
            _ => None,
        });
        if last_user != Some(prompt) {
            transcript.push(TranscriptEntry::user(prompt));
        }
        self.tracker.step("Run started");

        // ITERATE
        loop {
            if self.stop_requested() {
                return Ok(self.stopped());
            }
            if self.iteration >= self.max_iterations {
                return self.complete_partial();
            }

            let response = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(self.stopped()),
                response = self.ctx.model.respond(&transcript, &schema) => response?,
            };
            if self.stop_requested() {
                return Ok(self.stopped());
            }

            let calls = match response {
                ModelResponse::Text { text } => return self.complete(text).await,
                ModelResponse::ToolCalls { calls } if calls.is_empty() => {
                    return self.complete(String::new()).await;
                }
                ModelResponse::ToolCalls { calls } => calls,
            };

            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            self.tracker
                .step(format!("Model requested {}", names.join(", ")));
            transcript.push(TranscriptEntry::ToolCalls {
                calls: calls.clone(),
            });

            for call in &calls {
                let outcome = tool_gate::run_tool_call(
                    self.ctx,
                    self.session_id,
                    call,
                    &self.cancel,
                    &self.tracker,
                )
                .await?;
                if self.stop_requested() {
                    return Ok(self.stopped());
                }
                match outcome {
                    GateOutcome::Finished(entry) => transcript.push(entry),
                    GateOutcome::Stopped => return Ok(self.stopped()),
                }
            }

            self.iteration = self.ctx.registry.increment_iteration(self.session_id)?;
            self.tracker.iteration(self.iteration);
            debug!(iteration = self.iteration, "iteration finished");
        }
    }

    fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled() || self.ctx.registry.is_stop_requested(self.session_id)
    }

    async fn complete(&self, text: String) -> Result<RunResult, RuntimeError> {
        match self.ctx.registry.complete(self.session_id, &text) {
            Ok(_) => {}
            // A stop landed after the answer arrived; the answer is dropped.
            Err(RuntimeError::InvalidTransition { .. }) => return Ok(self.stopped()),
            Err(e) => return Err(e),
        }
        if let Some(conv) = &self.conversation_id {
            // The session is already completed; its summary keeps the answer.
            if let Err(e) = self
                .ctx
                .history
                .append(conv, TranscriptEntry::assistant(text.clone()))
                .await
            {
                warn!(error = %e, "final answer not recorded in history");
            }
        }
        let _ = self
            .tracker
            .finish(RunPhase::Completed, Some(text.clone()), None);
        Ok(self.result(RunOutcome::Completed, Some(text)))
    }

    fn complete_partial(&self) -> Result<RunResult, RuntimeError> {
        let summary = format!(
            "Iteration limit reached after {} of {} iterations",
            self.iteration, self.max_iterations
        );
        match self.ctx.registry.complete_partial(self.session_id, &summary) {
            Ok(_) => {}
            Err(RuntimeError::InvalidTransition { .. }) => return Ok(self.stopped()),
            Err(e) => return Err(e),
        }
        warn!(iterations = self.iteration, "iteration limit reached");
        let _ = self
            .tracker
            .finish(RunPhase::CompletedPartial, Some(summary.clone()), None);
        Ok(self.result(RunOutcome::CompletedPartial, Some(summary)))
    }

    fn stopped(&self) -> RunResult {
        warn!(iterations = self.iteration, "run stopped");
        let _ = self.tracker.finish(RunPhase::Stopped, None, None);
        self.result(RunOutcome::Stopped, None)
    }

    fn fail(&self, err: &RuntimeError) {
        let message = err.to_string();
        if let Err(e) = self.ctx.registry.error(self.session_id, &message) {
            debug!(error = %e, "session not marked errored");
        }
        let _ = self
            .tracker
            .finish(RunPhase::Errored, None, Some(message));
        error!(category = err.category(), error = %err, "run failed");
    }

    fn result(&self, outcome: RunOutcome, final_content: Option<String>) -> RunResult {
        RunResult {
            session_id: self.session_id.clone(),
            outcome,
            iterations: self.iteration,
            final_content,
        }
    }
}
