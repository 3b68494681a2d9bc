//! # conductor-runtime
//!
//! Session orchestration: runs agent sessions per conversation, queues
//! messages that arrive while a run is busy, and gates tool calls on human
//! approval.
//!
//! - **Session registry**: session records and their state machine
//! - **Message queue**: per-conversation FIFO with a processing token
//! - **Approval broker**: correlates human decisions with suspended tool calls
//! - **Run loop**: model call → tool gate → iterate, until a terminal state
//! - **Queue drain**: consumes queued messages once a conversation is free
//! - **Orchestrator**: facade owning all of the above and the conversation tasks
//!
//! ## Crate Position
//!
//! Top layer. Depends on: conductor-core, conductor-settings.

#![deny(unsafe_code)]

pub mod agent;
pub mod approval;
pub mod errors;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export main public API
pub use agent::event_emitter::ProgressEmitter;
pub use agent::run_loop::{RunContext, run_session};
pub use approval::{ApprovalBroker, ApprovalDecision, ApprovalRequest, DenialReason};
pub use errors::RuntimeError;
pub use orchestrator::{Collaborators, DrainReport, DrainStop, Orchestrator};
pub use queue::{MessageQueue, MessageStatus, ProcessingGuard, QueuedMessage};
pub use session::{RunGuard, Session, SessionPatch, SessionRegistry, SessionStatus};
pub use types::{RunConfig, RunOutcome, RunResult, TaskRequest, TaskStart};
