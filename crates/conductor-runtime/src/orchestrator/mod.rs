//! Orchestrator facade and the queue drain it runs after every session.

pub mod drain;
#[allow(clippy::module_inception)]
pub mod orchestrator;

pub use drain::{DrainReport, DrainStop, drain_queue};
pub use orchestrator::{Collaborators, Orchestrator};
