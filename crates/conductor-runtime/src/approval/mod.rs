//! Tool approval gate.

pub mod broker;

pub use broker::{ApprovalBroker, ApprovalDecision, ApprovalHandle, ApprovalRequest, DenialReason};
