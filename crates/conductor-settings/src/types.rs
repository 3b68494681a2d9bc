//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON files deserialize with defaults for every missing field.

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConductorSettings {
    /// Run loop settings.
    pub agent: AgentSettings,
    /// Tool approval gate.
    pub approval: ApprovalSettings,
    /// Per-conversation queue behavior.
    pub queue: QueueSettings,
    /// Progress broadcasting.
    pub progress: ProgressSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

/// Run loop settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Iteration budget per run. Reaching it ends the run as a partial completion.
    pub max_iterations: u32,
    /// Byte budget for titles derived from task text.
    pub title_max_bytes: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            title_max_bytes: 80,
        }
    }
}

/// Which tool calls need a human decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Never ask.
    Never,
    /// Ask for every tool call.
    Always,
    /// Ask only for the tools listed in [`ApprovalSettings::tools`].
    #[default]
    Listed,
}

/// Tool approval gate settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalSettings {
    /// Gate mode.
    pub mode: ApprovalMode,
    /// Tools requiring approval in [`ApprovalMode::Listed`].
    pub tools: Vec<String>,
    /// Resolve an unanswered approval as denied after this long. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ApprovalSettings {
    /// Whether calling `tool_name` needs approval.
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        match self.mode {
            ApprovalMode::Never => false,
            ApprovalMode::Always => true,
            ApprovalMode::Listed => self.tools.iter().any(|t| t == tool_name),
        }
    }
}

/// Per-conversation queue settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Pause a conversation's queue when its session is stopped.
    pub pause_on_stop: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            pause_on_stop: true,
        }
    }
}

/// Progress broadcasting settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressSettings {
    /// Broadcast channel capacity. Slow subscribers lag instead of blocking runs.
    pub channel_capacity: usize,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            json: false,
        }
    }
}
