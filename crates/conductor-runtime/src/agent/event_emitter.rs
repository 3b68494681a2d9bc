//! Broadcast-based progress emitter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use conductor_core::progress::{ProgressSink, ProgressSnapshot};
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-based progress emitter.
///
/// Non-blocking: `emit` never awaits. Slow receivers lag rather than
/// blocking the run. An optional downstream sink sees every snapshot too.
pub struct ProgressEmitter {
    tx: broadcast::Sender<ProgressSnapshot>,
    emit_count: AtomicU64,
    forward: Option<Arc<dyn ProgressSink>>,
}

impl ProgressEmitter {
    /// Create a new emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new emitter with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
            forward: None,
        }
    }

    /// Also hand every snapshot to `sink`.
    #[must_use]
    pub fn with_forward(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.forward = Some(sink);
        self
    }

    /// Emit a snapshot to all subscribers.
    ///
    /// Returns the number of receivers that got it (0 with no subscribers).
    pub fn emit(&self, snapshot: ProgressSnapshot) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = &self.forward {
            sink.publish(snapshot.clone());
        }
        self.tx.send(snapshot).unwrap_or(0)
    }

    /// Receive every snapshot emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total snapshots emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressEmitter {
    fn publish(&self, snapshot: ProgressSnapshot) {
        let _ = self.emit(snapshot);
    }
}
