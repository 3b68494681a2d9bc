//! Tool approval broker. Routes human decisions back to suspended runs.
//!
//! Each request gets a oneshot channel keyed by approval ID. The sender is
//! removed from the map before it is used, so an approval resolves at most
//! once no matter how responses and cancellations interleave.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use conductor_core::ids::{ApprovalId, SessionId, ToolCallId};
use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::RuntimeError;

/// Why an approval came back denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// A human said no.
    User,
    /// The session was stopped while waiting.
    SessionStopped,
    /// Nobody answered within the configured timeout.
    TimedOut,
    /// The broker dropped the request (shutdown).
    Abandoned,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "denied by user"),
            Self::SessionStopped => write!(f, "session stopped"),
            Self::TimedOut => write!(f, "approval timed out"),
            Self::Abandoned => write!(f, "approval abandoned"),
        }
    }
}

/// Outcome of an approval request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Run the tool.
    Approved,
    /// Do not run the tool.
    Denied(DenialReason),
}

impl ApprovalDecision {
    /// Whether the tool may run.
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Public view of an outstanding approval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Approval ID.
    pub id: ApprovalId,
    /// Session waiting on the decision.
    pub session_id: SessionId,
    /// Tool call being gated.
    pub tool_call_id: ToolCallId,
    /// Tool name.
    pub tool_name: String,
    /// Arguments the tool would run with.
    pub arguments: Map<String, Value>,
    /// When the request was made.
    pub created_at: DateTime<Utc>,
}

struct PendingApproval {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalDecision>,
}

/// Receiving end of one approval request.
#[derive(Debug)]
pub struct ApprovalHandle {
    approval_id: ApprovalId,
    rx: oneshot::Receiver<ApprovalDecision>,
}

impl ApprovalHandle {
    /// Approval ID to hand to whoever decides.
    pub fn approval_id(&self) -> &ApprovalId {
        &self.approval_id
    }

    /// Wait for the decision. Cancel-safe.
    ///
    /// A request dropped from the broker without an answer comes back denied.
    pub async fn decision(&mut self) -> ApprovalDecision {
        (&mut self.rx)
            .await
            .unwrap_or(ApprovalDecision::Denied(DenialReason::Abandoned))
    }
}

/// Correlates asynchronous approval decisions with suspended tool calls.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<ApprovalId, PendingApproval>>,
}

impl ApprovalBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an approval for one tool call.
    ///
    /// Fails with `DuplicateApproval` if the tool call already has one open.
    pub fn request_approval(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
        tool_name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ApprovalHandle, RuntimeError> {
        let mut pending = self.pending.lock();
        if pending
            .values()
            .any(|p| &p.request.tool_call_id == tool_call_id)
        {
            return Err(RuntimeError::DuplicateApproval(tool_call_id.clone()));
        }

        let id = ApprovalId::new();
        let (tx, rx) = oneshot::channel();
        let request = ApprovalRequest {
            id: id.clone(),
            session_id: session_id.clone(),
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.to_owned(),
            arguments: arguments.clone(),
            created_at: Utc::now(),
        };
        let _ = pending.insert(id.clone(), PendingApproval { request, tx });
        set_gauge(pending.len());
        debug!(approval_id = %id, session_id = %session_id, tool_name, "approval requested");
        Ok(ApprovalHandle { approval_id: id, rx })
    }

    /// Deliver a human decision.
    ///
    /// Returns `false` if the approval is unknown or already resolved.
    pub fn respond(&self, approval_id: &ApprovalId, approved: bool) -> bool {
        let decision = if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied(DenialReason::User)
        };
        let resolved = self.resolve(approval_id, decision);
        if resolved {
            debug!(approval_id = %approval_id, approved, "approval answered");
        }
        resolved
    }

    /// Deny an approval because nobody answered in time.
    pub fn expire(&self, approval_id: &ApprovalId) -> bool {
        let resolved = self.resolve(approval_id, ApprovalDecision::Denied(DenialReason::TimedOut));
        if resolved {
            warn!(approval_id = %approval_id, "approval timed out");
        }
        resolved
    }

    /// Deny every outstanding approval of a session. Returns how many there were.
    pub fn cancel_session_approvals(&self, session_id: &SessionId) -> usize {
        let cancelled: Vec<PendingApproval> = {
            let mut pending = self.pending.lock();
            let ids: Vec<ApprovalId> = pending
                .iter()
                .filter(|(_, p)| &p.request.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            let cancelled = ids.iter().filter_map(|id| pending.remove(id)).collect();
            set_gauge(pending.len());
            cancelled
        };
        let count = cancelled.len();
        for p in cancelled {
            let _ = p
                .tx
                .send(ApprovalDecision::Denied(DenialReason::SessionStopped));
        }
        if count > 0 {
            warn!(session_id = %session_id, count, "approvals cancelled");
        }
        count
    }

    /// Outstanding approvals of a session, oldest first.
    pub fn pending(&self, session_id: &SessionId) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .values()
            .filter(|p| &p.request.session_id == session_id)
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requests
    }

    /// Whether an approval is outstanding.
    pub fn has_pending(&self, approval_id: &ApprovalId) -> bool {
        self.pending.lock().contains_key(approval_id)
    }

    /// Number of outstanding approvals.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every outstanding approval; waiters see them as denied.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingApproval> = {
            let mut pending = self.pending.lock();
            let drained = pending.drain().map(|(_, p)| p).collect();
            set_gauge(0);
            drained
        };
        let count = drained.len();
        drop(drained);
        count
    }

    fn resolve(&self, approval_id: &ApprovalId, decision: ApprovalDecision) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let entry = pending.remove(approval_id);
            set_gauge(pending.len());
            entry
        };
        entry.is_some_and(|p| p.tx.send(decision).is_ok())
    }
}

#[allow(clippy::cast_precision_loss)]
fn set_gauge(len: usize) {
    gauge!("conductor_approvals_pending").set(len as f64);
}
