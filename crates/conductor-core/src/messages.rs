//! Transcript entries exchanged with the model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::ToolCallId;

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Unique tool call ID.
    pub id: ToolCallId,
    /// Tool name.
    pub name: String,
    /// Tool arguments (JSON object).
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Create a tool call with a fresh ID.
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of the running transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// User turn.
    User {
        /// Message text.
        text: String,
        /// When the turn was recorded.
        timestamp: DateTime<Utc>,
    },
    /// Final assistant text.
    Assistant {
        /// Message text.
        text: String,
        /// When the turn was recorded.
        timestamp: DateTime<Utc>,
    },
    /// Assistant turn that requested tool calls.
    ToolCalls {
        /// The requested calls, in model order.
        calls: Vec<ToolCall>,
    },
    /// Result of one tool call.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// The call this result answers.
        tool_call_id: ToolCallId,
        /// Tool name.
        tool_name: String,
        /// Output text (or error description).
        content: String,
        /// Whether the tool failed, was denied, or was cancelled.
        is_error: bool,
    },
}

impl TranscriptEntry {
    /// User entry stamped with the current time.
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Assistant entry stamped with the current time.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Text of a user or assistant entry.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::User { text, .. } | Self::Assistant { text, .. } => Some(text),
            Self::ToolCalls { .. } | Self::ToolResult { .. } => None,
        }
    }

    /// Whether this is a tool result tagged as an error.
    pub fn is_error_result(&self) -> bool {
        matches!(self, Self::ToolResult { is_error: true, .. })
    }
}
