//! Progress snapshots published to external observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ApprovalId, ConversationId, SessionId};

/// Where a run currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Calling the model or executing tools.
    Running,
    /// Suspended on a human approval decision.
    AwaitingApproval,
    /// Model produced a final answer.
    Completed,
    /// Iteration budget exhausted before a final answer.
    CompletedPartial,
    /// Stopped by an external request.
    Stopped,
    /// Unrecoverable failure.
    Errored,
}

impl RunPhase {
    /// Whether no further snapshots follow for this run.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running | Self::AwaitingApproval)
    }
}

/// One human-readable step of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    /// Iteration the step belongs to.
    pub iteration: u32,
    /// What happened.
    pub description: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Approval the run is waiting on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalInfo {
    /// ID to pass to `respond_to_approval`.
    pub approval_id: ApprovalId,
    /// Tool awaiting approval.
    pub tool_name: String,
    /// Arguments the tool would run with.
    pub arguments: Map<String, Value>,
}

/// Point-in-time view of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Session being run.
    pub session_id: SessionId,
    /// Conversation the session is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Current phase.
    pub phase: RunPhase,
    /// Iterations completed so far.
    pub iteration: u32,
    /// Iteration budget.
    pub max_iterations: u32,
    /// Steps so far, oldest first.
    pub steps: Vec<ProgressStep>,
    /// Whether the run has finished (any terminal phase).
    pub is_complete: bool,
    /// Whether the run ended at the iteration limit.
    pub is_partial: bool,
    /// Set while the run is suspended on an approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApprovalInfo>,
    /// Final answer, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    /// Human-readable failure, for errored runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Receives progress snapshots. Must not block.
pub trait ProgressSink: Send + Sync {
    /// Publish a snapshot.
    fn publish(&self, snapshot: ProgressSnapshot);
}

/// Sink that drops every snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn publish(&self, _snapshot: ProgressSnapshot) {}
}
