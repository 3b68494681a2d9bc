//! Session records, their state machine, and the registry that owns them.

pub mod registry;
pub mod types;

pub use registry::{RunGuard, SessionRegistry};
pub use types::{Session, SessionPatch, SessionStatus};
