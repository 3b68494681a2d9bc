//! Scripted collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::history::{ConversationHistory, InMemoryHistory};
use conductor_core::ids::{ConversationId, SessionId};
use conductor_core::messages::{ToolCall, TranscriptEntry};
use conductor_core::model::{ModelClient, ModelError, ModelResponse};
use conductor_core::progress::{ProgressSink, ProgressSnapshot, RunPhase};
use conductor_core::tools::{ToolContext, ToolExecutor, ToolFailure, ToolOutput, ToolSchema};
use conductor_settings::{ApprovalMode, ApprovalSettings};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::progress::ProgressTracker;
use crate::agent::run_loop::RunContext;
use crate::approval::ApprovalBroker;
use crate::orchestrator::Collaborators;
use crate::session::SessionRegistry;
use crate::types::RunConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted model turn.
pub(crate) enum Step {
    Respond(ModelResponse),
    Fail(ModelError),
    /// Never answers.
    Hang,
}

impl Step {
    pub(crate) fn text(text: &str) -> Self {
        Self::Respond(ModelResponse::Text {
            text: text.to_owned(),
        })
    }

    pub(crate) fn tools(names: &[&str]) -> Self {
        Self::Respond(ModelResponse::ToolCalls {
            calls: names
                .iter()
                .map(|n| ToolCall::new(*n, serde_json::Map::new()))
                .collect(),
        })
    }
}

/// Plays back steps in order, then answers "done".
#[derive(Default)]
pub(crate) struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    transcripts: Mutex<Vec<Vec<TranscriptEntry>>>,
    called: Notify,
}

impl ScriptedModel {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.transcripts.lock().len()
    }

    pub(crate) fn transcript(&self, n: usize) -> Vec<TranscriptEntry> {
        self.transcripts.lock()[n].clone()
    }

    pub(crate) fn transcript_lens(&self) -> Vec<usize> {
        self.transcripts.lock().iter().map(Vec::len).collect()
    }

    pub(crate) async fn wait_called(&self) {
        self.called.notified().await;
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn respond(
        &self,
        transcript: &[TranscriptEntry],
        _tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelError> {
        self.transcripts.lock().push(transcript.to_vec());
        let step = self.steps.lock().pop_front();
        self.called.notify_one();
        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => std::future::pending().await,
            None => Ok(ModelResponse::Text {
                text: "done".into(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub(crate) enum ToolBehavior {
    /// Succeeds with "{name} ok".
    Echo,
    Transient(String),
    Fatal(String),
    /// Reports "{name}: halfway" then succeeds.
    Report,
    /// Runs until the session is cancelled.
    WaitForCancel,
}

#[derive(Default)]
pub(crate) struct ScriptedTools {
    behaviors: HashMap<String, ToolBehavior>,
    executed: Mutex<Vec<String>>,
    started: Notify,
}

impl ScriptedTools {
    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub(crate) async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl ToolExecutor for ScriptedTools {
    fn schema(&self) -> Vec<ToolSchema> {
        self.behaviors
            .keys()
            .map(|name| ToolSchema {
                name: name.clone(),
                description: format!("scripted {name}"),
                parameters: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolFailure> {
        self.executed.lock().push(call.name.clone());
        self.started.notify_one();
        let behavior = self
            .behaviors
            .get(&call.name)
            .cloned()
            .ok_or_else(|| ToolFailure::Transient(format!("unknown tool {}", call.name)))?;
        match behavior {
            ToolBehavior::Echo => Ok(ToolOutput::text(format!("{} ok", call.name))),
            ToolBehavior::Transient(message) => Err(ToolFailure::Transient(message)),
            ToolBehavior::Fatal(message) => Err(ToolFailure::Fatal(message)),
            ToolBehavior::Report => {
                ctx.report(&format!("{}: halfway", call.name));
                Ok(ToolOutput::text(format!("{} ok", call.name)))
            }
            ToolBehavior::WaitForCancel => {
                ctx.cancellation.cancelled().await;
                Ok(ToolOutput::error("cancelled"))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct RecordingSink(Mutex<Vec<ProgressSnapshot>>);

impl RecordingSink {
    pub(crate) fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.0.lock().clone()
    }

    pub(crate) fn last(&self) -> Option<ProgressSnapshot> {
        self.0.lock().last().cloned()
    }

    pub(crate) fn phases(&self) -> Vec<RunPhase> {
        self.0.lock().iter().map(|s| s.phase).collect()
    }

    pub(crate) fn terminal_count(&self) -> usize {
        self.0.lock().iter().filter(|s| s.is_complete).count()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, snapshot: ProgressSnapshot) {
        self.0.lock().push(snapshot);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct HarnessBuilder {
    tools: HashMap<String, ToolBehavior>,
    script: Vec<Step>,
    approval: ApprovalSettings,
    max_iterations: u32,
}

impl HarnessBuilder {
    pub(crate) fn tool(mut self, name: &str, behavior: ToolBehavior) -> Self {
        let _ = self.tools.insert(name.to_owned(), behavior);
        self
    }

    pub(crate) fn script(mut self, steps: Vec<Step>) -> Self {
        self.script = steps;
        self
    }

    pub(crate) fn approval(mut self, mode: ApprovalMode, timeout_ms: Option<u64>) -> Self {
        self.approval.mode = mode;
        self.approval.timeout_ms = timeout_ms;
        self
    }

    pub(crate) fn approve_tools(mut self, names: &[&str]) -> Self {
        self.approval.tools = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    pub(crate) fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub(crate) fn build(self) -> Harness {
        let model = Arc::new(ScriptedModel::new(self.script));
        let tools = Arc::new(ScriptedTools {
            behaviors: self.tools,
            ..ScriptedTools::default()
        });
        let history = Arc::new(InMemoryHistory::new());
        let sink = Arc::new(RecordingSink::default());
        let config = RunConfig {
            max_iterations: self.max_iterations,
            approval: self.approval,
            ..RunConfig::default()
        };
        let ctx = RunContext {
            registry: Arc::new(SessionRegistry::new(config.max_iterations)),
            broker: Arc::new(ApprovalBroker::new()),
            model: model.clone(),
            tools: tools.clone(),
            history: history.clone(),
            progress: sink.clone(),
            config,
        };
        Harness {
            ctx,
            model,
            tools,
            history,
            sink,
        }
    }
}

pub(crate) struct Harness {
    pub(crate) ctx: RunContext,
    pub(crate) model: Arc<ScriptedModel>,
    pub(crate) tools: Arc<ScriptedTools>,
    pub(crate) history: Arc<InMemoryHistory>,
    pub(crate) sink: Arc<RecordingSink>,
}

impl Harness {
    pub(crate) fn builder() -> HarnessBuilder {
        HarnessBuilder {
            tools: HashMap::new(),
            script: Vec::new(),
            approval: ApprovalSettings {
                mode: ApprovalMode::Never,
                ..ApprovalSettings::default()
            },
            max_iterations: 10,
        }
    }

    /// Collaborators for building an orchestrator over the same mocks.
    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            model: self.model.clone(),
            tools: self.tools.clone(),
            history: self.history.clone(),
        }
    }

    /// Active session with no conversation.
    pub(crate) fn session(&self) -> SessionId {
        self.ctx.registry.start(None, "test", false)
    }

    /// Active session bound to a new conversation whose history holds `prompt`.
    pub(crate) async fn bound_session(&self, prompt: &str) -> (SessionId, ConversationId) {
        let conv = self.history.create("test").await.unwrap();
        self.history
            .append(&conv, TranscriptEntry::user(prompt))
            .await
            .unwrap();
        let sid = self.ctx.registry.start(Some(conv.clone()), "test", false);
        (sid, conv)
    }

    pub(crate) fn token(&self, sid: &SessionId) -> CancellationToken {
        self.ctx.registry.cancellation(sid).unwrap()
    }

    pub(crate) fn tracker(&self, sid: &SessionId) -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(
            sid.clone(),
            None,
            self.ctx.config.max_iterations,
            self.sink.clone(),
        ))
    }

    /// Answer every approval request as it appears, until the task is dropped.
    pub(crate) fn auto_respond(&self, approved: bool) -> AbortOnDrop {
        let registry = Arc::clone(&self.ctx.registry);
        let broker = Arc::clone(&self.ctx.broker);
        AbortOnDrop(tokio::spawn(async move {
            loop {
                for session in registry.list_recent(usize::MAX) {
                    for request in broker.pending(&session.id) {
                        let _ = broker.respond(&request.id, approved);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }))
    }
}

pub(crate) struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
