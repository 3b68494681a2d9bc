//! Runtime error types.

use conductor_core::history::HistoryError;
use conductor_core::ids::{ConversationId, MessageId, SessionId, ToolCallId};
use conductor_core::model::ModelError;

use crate::queue::types::MessageStatus;
use crate::session::types::SessionStatus;

/// Errors that can occur while orchestrating sessions.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The model client failed. Fatal to the run that made the call.
    #[error("Model call failed: {0}")]
    ModelCall(#[from] ModelError),

    /// The tool execution pipeline failed in a way the run cannot absorb.
    #[error("Tool pipeline failed: {tool_name}: {message}")]
    ToolPipeline {
        /// Tool name.
        tool_name: String,
        /// Error description.
        message: String,
    },

    /// Conversation history backend failed.
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    /// Session not found.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session already has a run in flight.
    #[error("Session busy: {0}")]
    SessionBusy(SessionId),

    /// Queued message not found.
    #[error("Queued message not found: {0}")]
    MessageNotFound(MessageId),

    /// Queued message is being processed and cannot be edited or removed.
    #[error("Queued message is being processed: {0}")]
    MessageBusy(MessageId),

    /// Queued message is not in the status the operation needs.
    #[error("Queued message {id} is {actual}, expected {expected}")]
    InvalidMessageState {
        /// Message ID.
        id: MessageId,
        /// Status the operation requires.
        expected: MessageStatus,
        /// Status the message actually has.
        actual: MessageStatus,
    },

    /// Reorder referenced a message outside the conversation's queue.
    #[error("Message {message_id} is not queued in conversation {conversation_id}")]
    NotInQueue {
        /// Conversation being reordered.
        conversation_id: ConversationId,
        /// Offending message.
        message_id: MessageId,
    },

    /// Session status change not allowed by the state machine.
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },

    /// Patch would push the iteration count past the budget.
    #[error("Iteration count {count} exceeds limit {max}")]
    IterationLimit {
        /// Requested iteration count.
        count: u32,
        /// Budget.
        max: u32,
    },

    /// An approval is already outstanding for this tool call.
    #[error("Approval already pending for tool call: {0}")]
    DuplicateApproval(ToolCallId),

    /// Operation was cancelled via the session's cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl RuntimeError {
    /// Whether the error is recoverable (user can retry).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ModelCall(e) => e.is_retryable(),
            Self::Cancelled
            | Self::SessionBusy(_)
            | Self::MessageBusy(_)
            | Self::History(_)
            | Self::IterationLimit { .. } => true,
            Self::ToolPipeline { .. }
            | Self::SessionNotFound(_)
            | Self::MessageNotFound(_)
            | Self::InvalidMessageState { .. }
            | Self::NotInQueue { .. }
            | Self::InvalidTransition { .. }
            | Self::DuplicateApproval(_) => false,
        }
    }

    /// Error category string for logs and progress snapshots.
    pub fn category(&self) -> &str {
        match self {
            Self::ModelCall(_) => "model_call",
            Self::ToolPipeline { .. } => "tool_pipeline",
            Self::History(_) => "history",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionBusy(_) => "session_busy",
            Self::MessageNotFound(_) => "message_not_found",
            Self::MessageBusy(_) => "message_busy",
            Self::InvalidMessageState { .. } => "invalid_message_state",
            Self::NotInQueue { .. } => "not_in_queue",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::IterationLimit { .. } => "iteration_limit",
            Self::DuplicateApproval(_) => "duplicate_approval",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_pipeline_display() {
        let err = RuntimeError::ToolPipeline {
            tool_name: "bash".into(),
            message: "executor crashed".into(),
        };
        assert_eq!(err.to_string(), "Tool pipeline failed: bash: executor crashed");
    }

    #[test]
    fn transition_display() {
        let err = RuntimeError::InvalidTransition {
            from: SessionStatus::Completed,
            to: SessionStatus::Snoozed,
        };
        assert_eq!(
            err.to_string(),
            "Invalid session transition: completed -> snoozed"
        );
    }

    #[test]
    fn message_state_display() {
        let err = RuntimeError::InvalidMessageState {
            id: MessageId::from("msg_1"),
            expected: MessageStatus::Failed,
            actual: MessageStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "Queued message msg_1 is pending, expected failed"
        );
    }

    #[test]
    fn model_error_converts() {
        let err: RuntimeError = ModelError::InvalidResponse("empty".into()).into();
        assert_eq!(err.category(), "model_call");
        assert!(!err.is_recoverable());

        let err: RuntimeError = ModelError::Request {
            message: "503".into(),
        }
        .into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn categories() {
        assert_eq!(RuntimeError::Cancelled.category(), "cancelled");
        assert_eq!(
            RuntimeError::SessionNotFound(SessionId::from("sess_x")).category(),
            "session_not_found"
        );
        assert_eq!(
            RuntimeError::MessageBusy(MessageId::from("msg_x")).category(),
            "message_busy"
        );
        assert_eq!(
            RuntimeError::IterationLimit { count: 6, max: 5 }.category(),
            "iteration_limit"
        );
        assert_eq!(
            RuntimeError::DuplicateApproval(ToolCallId::from("call_1")).category(),
            "duplicate_approval"
        );
    }

    #[test]
    fn recoverability() {
        assert!(RuntimeError::Cancelled.is_recoverable());
        assert!(RuntimeError::SessionBusy(SessionId::from("sess_1")).is_recoverable());
        assert!(RuntimeError::History(HistoryError::Backend("down".into())).is_recoverable());
        assert!(
            !RuntimeError::ToolPipeline {
                tool_name: "t".into(),
                message: "m".into()
            }
            .is_recoverable()
        );
        assert!(!RuntimeError::SessionNotFound(SessionId::from("sess_1")).is_recoverable());
    }
}
