//! Tool schema, execution context, and the tool executor boundary.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::{SessionId, ToolCallId};
use crate::messages::ToolCall;

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

/// A tool definition offered to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name (unique identifier).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Output of a tool execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    /// Output text shown to the model.
    pub content: String,
    /// Whether the execution resulted in an error.
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful text output.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Error output.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A tool pipeline failure raised by the executor instead of a result.
#[derive(Debug, thiserror::Error)]
pub enum ToolFailure {
    /// The call failed but the run may continue; reported to the model.
    #[error("{0}")]
    Transient(String),
    /// The execution pipeline itself is broken; the run must stop.
    #[error("{0}")]
    Fatal(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution context
// ─────────────────────────────────────────────────────────────────────────────

/// Callback a tool may use to report intermediate progress.
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call context handed to the executor.
#[derive(Clone)]
pub struct ToolContext {
    /// Session running the call.
    pub session_id: SessionId,
    /// The call being executed.
    pub tool_call_id: ToolCallId,
    /// Cancelled when the session is stopped. Tools decide how to wind down.
    pub cancellation: CancellationToken,
    /// Optional progress reporter.
    pub on_progress: Option<ProgressCallback>,
}

impl ToolContext {
    /// Report progress if a callback is installed.
    pub fn report(&self, description: &str) {
        if let Some(cb) = &self.on_progress {
            cb(description);
        }
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Narrow interface to the tool execution backend.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool definitions offered to the model.
    fn schema(&self) -> Vec<ToolSchema>;

    /// Execute one call.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolFailure>;
}
