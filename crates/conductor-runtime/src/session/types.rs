//! Session record and its state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use conductor_core::ids::{ConversationId, SessionId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Running, or ready to run.
    Active,
    /// Deprioritized from user attention but still running.
    Snoozed,
    /// Stopped by an external request.
    Stopped,
    /// Model produced a final answer.
    Completed,
    /// Iteration budget ran out before a final answer.
    CompletedPartial,
    /// Unrecoverable failure.
    Errored,
}

impl SessionStatus {
    /// Whether the session can still run.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Snoozed)
    }

    /// Whether the session has finished. Only `revive` leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    /// Whether moving from `self` to `next` is allowed in place.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Active, Self::Snoozed) | (Self::Snoozed, Self::Active) => true,
            (from, to) if from.is_live() => to.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Snoozed => write!(f, "snoozed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Completed => write!(f, "completed"),
            Self::CompletedPartial => write!(f, "completed_partial"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Point-in-time copy of a session record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session ID.
    pub id: SessionId,
    /// Bound conversation, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Iterations completed in the current run.
    pub iteration_count: u32,
    /// Iteration budget.
    pub max_iterations: u32,
    /// Display title.
    pub title: String,
    /// Final answer (or partial-completion note).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last time anything about the session changed.
    pub last_activity: DateTime<Utc>,
}

/// Partial update applied atomically by [`SessionRegistry::update`].
///
/// [`SessionRegistry::update`]: crate::session::registry::SessionRegistry::update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    /// New title.
    pub title: Option<String>,
    /// New iteration count.
    pub iteration_count: Option<u32>,
    /// New iteration budget.
    pub max_iterations: Option<u32>,
    /// Conversation to bind.
    pub conversation_id: Option<ConversationId>,
}
