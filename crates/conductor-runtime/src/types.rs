//! Run configuration and result types.

use std::fmt;

use conductor_core::ids::{ConversationId, MessageId, SessionId};
use conductor_settings::{ApprovalSettings, ConductorSettings};
use serde::{Deserialize, Serialize};

/// Settings that shape every run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// Iteration budget for new sessions.
    pub max_iterations: u32,
    /// Byte budget for titles derived from task text.
    pub title_max_bytes: usize,
    /// Approval gate policy.
    pub approval: ApprovalSettings,
    /// Pause a conversation's queue when its session is stopped.
    pub pause_on_stop: bool,
    /// Progress broadcast capacity.
    pub progress_capacity: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&ConductorSettings::default())
    }
}

impl From<&ConductorSettings> for RunConfig {
    fn from(settings: &ConductorSettings) -> Self {
        Self {
            max_iterations: settings.agent.max_iterations,
            title_max_bytes: settings.agent.title_max_bytes,
            approval: settings.approval.clone(),
            pause_on_stop: settings.queue.pause_on_stop,
            progress_capacity: settings.progress.channel_capacity,
        }
    }
}

/// How a run that did not error ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The model produced a final answer.
    Completed,
    /// The iteration budget ran out.
    CompletedPartial,
    /// A stop was observed.
    Stopped,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::CompletedPartial => write!(f, "completed_partial"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of one run of the orchestration loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Session that ran.
    pub session_id: SessionId,
    /// How it ended.
    pub outcome: RunOutcome,
    /// Iterations completed.
    pub iterations: u32,
    /// Final answer, or the partial-completion note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
}

/// Text for a conversation, plus where it should go.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskRequest {
    /// User text.
    pub text: String,
    /// Target conversation. A new one is created when neither this nor the
    /// session's binding names one.
    pub conversation_id: Option<ConversationId>,
    /// Session to resume.
    pub session_id: Option<SessionId>,
    /// Start (or revive) the session snoozed.
    pub start_snoozed: bool,
}

impl TaskRequest {
    /// Request for `text` in a new conversation.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Send to an existing conversation.
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Resume a specific session.
    #[must_use]
    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Start snoozed.
    #[must_use]
    pub fn snoozed(mut self) -> Self {
        self.start_snoozed = true;
        self
    }
}

/// What `start_or_resume_task` did with the text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStart {
    /// Session running (or bound to) the conversation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Conversation the text went to.
    pub conversation_id: ConversationId,
    /// Set when the conversation was busy and the text was queued instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_message_id: Option<MessageId>,
}

impl TaskStart {
    /// Whether the text was queued rather than started.
    pub fn was_queued(&self) -> bool {
        self.queued_message_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_settings::ApprovalMode;

    #[test]
    fn run_config_from_settings() {
        let mut settings = ConductorSettings::default();
        settings.agent.max_iterations = 3;
        settings.approval.mode = ApprovalMode::Always;
        settings.queue.pause_on_stop = false;

        let config = RunConfig::from(&settings);
        assert_eq!(config.max_iterations, 3);
        assert!(config.approval.requires_approval("anything"));
        assert!(!config.pause_on_stop);
        assert_eq!(config.progress_capacity, 1024);
    }

    #[test]
    fn outcome_wire_names() {
        assert_eq!(
            serde_json::to_value(RunOutcome::CompletedPartial).unwrap(),
            "completed_partial"
        );
        assert_eq!(RunOutcome::Stopped.to_string(), "stopped");
    }

    #[test]
    fn task_request_builder() {
        let req = TaskRequest::new("fix the build")
            .in_conversation(ConversationId::from("conv_1"))
            .snoozed();
        assert_eq!(req.text, "fix the build");
        assert_eq!(req.conversation_id, Some(ConversationId::from("conv_1")));
        assert!(req.session_id.is_none());
        assert!(req.start_snoozed);
    }

    #[test]
    fn task_start_queued() {
        let start = TaskStart {
            session_id: None,
            conversation_id: ConversationId::from("conv_1"),
            queued_message_id: Some(MessageId::from("msg_1")),
        };
        assert!(start.was_queued());
        let value = serde_json::to_value(&start).unwrap();
        assert_eq!(value["queuedMessageId"], "msg_1");
        assert!(value.get("sessionId").is_none());
    }
}
