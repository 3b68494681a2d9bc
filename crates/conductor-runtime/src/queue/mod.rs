//! Per-conversation message queue and its processing token.

pub mod message_queue;
pub mod types;

pub use message_queue::{MessageQueue, ProcessingGuard};
pub use types::{MessageStatus, QueuedMessage};
