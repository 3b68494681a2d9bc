//! Per-run progress tracking.
//!
//! Accumulates step descriptions for one run and publishes a snapshot after
//! every change. Exactly one terminal snapshot is published; anything after
//! it is dropped.

use std::sync::Arc;

use chrono::Utc;
use conductor_core::ids::{ConversationId, SessionId};
use conductor_core::progress::{
    PendingApprovalInfo, ProgressSink, ProgressSnapshot, ProgressStep, RunPhase,
};
use parking_lot::Mutex;

#[derive(Default)]
struct TrackerState {
    steps: Vec<ProgressStep>,
    iteration: u32,
    finished: bool,
}

/// Builds and publishes snapshots for one run.
pub struct ProgressTracker {
    session_id: SessionId,
    conversation_id: Option<ConversationId>,
    max_iterations: u32,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Tracker for a run of `session_id`.
    pub fn new(
        session_id: SessionId,
        conversation_id: Option<ConversationId>,
        max_iterations: u32,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            session_id,
            conversation_id,
            max_iterations,
            sink,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record a step at the current iteration and publish.
    pub fn step(&self, description: impl Into<String>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        let iteration = state.iteration;
        state.steps.push(ProgressStep {
            iteration,
            description: description.into(),
            at: Utc::now(),
        });
        self.publish(&state, RunPhase::Running, None, None, None);
    }

    /// Move to iteration `n` and publish.
    pub fn iteration(&self, n: u32) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.iteration = n;
        self.publish(&state, RunPhase::Running, None, None, None);
    }

    /// Publish that the run is suspended on an approval.
    pub fn awaiting_approval(&self, pending: PendingApprovalInfo) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        let iteration = state.iteration;
        state.steps.push(ProgressStep {
            iteration,
            description: format!("Waiting for approval to run {}", pending.tool_name),
            at: Utc::now(),
        });
        self.publish(&state, RunPhase::AwaitingApproval, Some(pending), None, None);
    }

    /// Publish the terminal snapshot. Returns `false` if one was already published.
    pub fn finish(
        &self,
        phase: RunPhase,
        final_content: Option<String>,
        error: Option<String>,
    ) -> bool {
        debug_assert!(phase.is_terminal());
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.finished = true;
        self.publish(&state, phase, None, final_content, error);
        true
    }

    /// Steps recorded so far.
    pub fn steps(&self) -> Vec<ProgressStep> {
        self.state.lock().steps.clone()
    }

    fn publish(
        &self,
        state: &TrackerState,
        phase: RunPhase,
        pending_approval: Option<PendingApprovalInfo>,
        final_content: Option<String>,
        error: Option<String>,
    ) {
        self.sink.publish(ProgressSnapshot {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            phase,
            iteration: state.iteration,
            max_iterations: self.max_iterations,
            steps: state.steps.clone(),
            is_complete: phase.is_terminal(),
            is_partial: phase == RunPhase::CompletedPartial,
            pending_approval,
            final_content,
            error,
            timestamp: Utc::now(),
        });
    }
}
