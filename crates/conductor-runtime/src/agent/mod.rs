//! Per-run machinery: the orchestration loop, its tool gate, and progress.

pub mod event_emitter;
pub mod progress;
pub mod run_loop;
pub(crate) mod tool_gate;

pub use event_emitter::ProgressEmitter;
pub use run_loop::{RunContext, run_session};
