//! Session registry: concurrent store of session records.
//!
//! One entry per session inside a sharded [`DashMap`]; each entry carries its
//! own lock, so writes to different sessions never contend. Listing clones the
//! entry handles first and then reads each one briefly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use conductor_core::ids::{ConversationId, SessionId};
use dashmap::DashMap;
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::errors::RuntimeError;
use crate::session::types::{Session, SessionPatch, SessionStatus};

struct SessionEntry {
    state: RwLock<Session>,
    /// Replaced on revive. Lock order: `state` before `cancel`.
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

/// Held while a run is in flight for a session. Dropping it frees the session.
pub struct RunGuard {
    entry: Arc<SessionEntry>,
}

impl RunGuard {
    fn acquire(entry: Arc<SessionEntry>) -> Option<Self> {
        entry
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        gauge!("conductor_runs_active").increment(1.0);
        Some(Self { entry })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.entry.running.store(false, Ordering::SeqCst);
        gauge!("conductor_runs_active").decrement(1.0);
    }
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("session_id", &self.entry.state.read().id)
            .finish_non_exhaustive()
    }
}

/// Owns every session record and its cancellation token.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    by_conversation: DashMap<ConversationId, SessionId>,
    default_max_iterations: u32,
}

impl SessionRegistry {
    /// Create an empty registry. New sessions get `default_max_iterations`.
    pub fn new(default_max_iterations: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            by_conversation: DashMap::new(),
            default_max_iterations,
        }
    }

    /// Create a session and return its ID.
    #[instrument(skip(self, title))]
    pub fn start(
        &self,
        conversation_id: Option<ConversationId>,
        title: &str,
        start_snoozed: bool,
    ) -> SessionId {
        let id = SessionId::new();
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            conversation_id: conversation_id.clone(),
            status: if start_snoozed {
                SessionStatus::Snoozed
            } else {
                SessionStatus::Active
            },
            iteration_count: 0,
            max_iterations: self.default_max_iterations,
            title: title.to_owned(),
            summary: None,
            error: None,
            created_at: now,
            last_activity: now,
        };
        let entry = Arc::new(SessionEntry {
            state: RwLock::new(session),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        });
        let _ = self.sessions.insert(id.clone(), entry);
        if let Some(conv) = conversation_id {
            let _ = self.by_conversation.insert(conv, id.clone());
        }
        debug!(session_id = %id, start_snoozed, "session started");
        id
    }

    /// Make a session live again, keeping its ID.
    ///
    /// A terminal session gets a fresh cancellation token, a zeroed iteration
    /// counter, and no summary or error. Returns `false` for an unknown ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn revive(&self, id: &SessionId, snoozed: bool) -> bool {
        let Some(entry) = self.lookup(id) else {
            return false;
        };
        let mut state = entry.state.write();
        if state.status.is_terminal() {
            state.iteration_count = 0;
            state.summary = None;
            state.error = None;
            *entry.cancel.lock() = CancellationToken::new();
        }
        let from = state.status;
        state.status = if snoozed {
            SessionStatus::Snoozed
        } else {
            SessionStatus::Active
        };
        state.last_activity = Utc::now();
        debug!(%from, to = %state.status, "session revived");
        true
    }

    /// Stop a live session and cancel its token.
    ///
    /// Returns `false` if the session had already finished.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn stop(&self, id: &SessionId) -> Result<bool, RuntimeError> {
        let entry = self.entry(id)?;
        let mut state = entry.state.write();
        if state.status.is_terminal() {
            debug!(status = %state.status, "stop ignored, session already finished");
            return Ok(false);
        }
        state.status = SessionStatus::Stopped;
        state.last_activity = Utc::now();
        entry.cancel.lock().cancel();
        warn!("session stopped");
        Ok(true)
    }

    /// Snooze a live session. Snoozing a snoozed session is a no-op.
    pub fn snooze(&self, id: &SessionId) -> Result<(), RuntimeError> {
        self.swap_live(id, SessionStatus::Snoozed)
    }

    /// Undo a snooze. Unsnoozing an active session is a no-op.
    pub fn unsnooze(&self, id: &SessionId) -> Result<(), RuntimeError> {
        self.swap_live(id, SessionStatus::Active)
    }

    /// Finish with a final answer.
    pub fn complete(&self, id: &SessionId, summary: &str) -> Result<Session, RuntimeError> {
        self.transition(id, SessionStatus::Completed, |s| {
            s.summary = Some(summary.to_owned());
        })
    }

    /// Finish because the iteration budget ran out.
    pub fn complete_partial(&self, id: &SessionId, summary: &str) -> Result<Session, RuntimeError> {
        self.transition(id, SessionStatus::CompletedPartial, |s| {
            s.summary = Some(summary.to_owned());
        })
    }

    /// Finish with an unrecoverable error.
    pub fn error(&self, id: &SessionId, message: &str) -> Result<Session, RuntimeError> {
        self.transition(id, SessionStatus::Errored, |s| {
            s.error = Some(message.to_owned());
        })
    }

    /// Apply a partial update atomically.
    ///
    /// Rejected without any change if the result would have
    /// `iteration_count > max_iterations`.
    pub fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<Session, RuntimeError> {
        let entry = self.entry(id)?;
        let updated = {
            let mut state = entry.state.write();
            let max = patch.max_iterations.unwrap_or(state.max_iterations);
            let count = patch.iteration_count.unwrap_or(state.iteration_count);
            if count > max {
                return Err(RuntimeError::IterationLimit { count, max });
            }
            state.max_iterations = max;
            state.iteration_count = count;
            if let Some(title) = patch.title {
                state.title = title;
            }
            if let Some(conv) = &patch.conversation_id {
                state.conversation_id = Some(conv.clone());
            }
            state.last_activity = Utc::now();
            state.clone()
        };
        if let Some(conv) = patch.conversation_id {
            let _ = self.by_conversation.insert(conv, id.clone());
        }
        Ok(updated)
    }

    /// Count one finished iteration. Fails at the budget instead of exceeding it.
    pub fn increment_iteration(&self, id: &SessionId) -> Result<u32, RuntimeError> {
        let entry = self.entry(id)?;
        let mut state = entry.state.write();
        if state.iteration_count >= state.max_iterations {
            return Err(RuntimeError::IterationLimit {
                count: state.iteration_count + 1,
                max: state.max_iterations,
            });
        }
        state.iteration_count += 1;
        state.last_activity = Utc::now();
        Ok(state.iteration_count)
    }

    /// Bind a session to a conversation. The conversation then resolves to it.
    ///
    /// A session with a run in flight cannot move to another conversation.
    pub fn bind_conversation(
        &self,
        id: &SessionId,
        conversation_id: &ConversationId,
    ) -> Result<(), RuntimeError> {
        let entry = self.entry(id)?;
        {
            let mut state = entry.state.write();
            let moving = state.conversation_id.as_ref() != Some(conversation_id);
            if moving && entry.running.load(Ordering::SeqCst) {
                return Err(RuntimeError::SessionBusy(id.clone()));
            }
            state.conversation_id = Some(conversation_id.clone());
            state.last_activity = Utc::now();
        }
        let _ = self.by_conversation.insert(conversation_id.clone(), id.clone());
        Ok(())
    }

    /// Most recent session bound to a conversation.
    pub fn find_by_conversation_id(&self, conversation_id: &ConversationId) -> Option<SessionId> {
        self.by_conversation
            .get(conversation_id)
            .map(|e| e.value().clone())
    }

    /// Snapshot of one session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.lookup(id).map(|e| e.state.read().clone())
    }

    /// Whether the run for `id` should wind down. Unknown sessions count as stopped.
    pub fn is_stop_requested(&self, id: &SessionId) -> bool {
        self.lookup(id).is_none_or(|e| {
            e.state.read().status == SessionStatus::Stopped || e.cancel.lock().is_cancelled()
        })
    }

    /// The session's current cancellation token.
    pub fn cancellation(&self, id: &SessionId) -> Option<CancellationToken> {
        self.lookup(id).map(|e| e.cancel.lock().clone())
    }

    /// Claim the session for one run. Fails with `SessionBusy` if a run is in flight.
    pub fn begin_run(&self, id: &SessionId) -> Result<RunGuard, RuntimeError> {
        let entry = self.entry(id)?;
        RunGuard::acquire(entry).ok_or_else(|| RuntimeError::SessionBusy(id.clone()))
    }

    /// Whether a run is in flight for `id`.
    pub fn is_running(&self, id: &SessionId) -> bool {
        self.lookup(id)
            .is_some_and(|e| e.running.load(Ordering::SeqCst))
    }

    /// Number of sessions with a run in flight.
    pub fn running_count(&self) -> usize {
        self.handles()
            .iter()
            .filter(|e| e.running.load(Ordering::SeqCst))
            .count()
    }

    /// Live sessions, most recently active first.
    pub fn list_active(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .handles()
            .iter()
            .map(|e| e.state.read().clone())
            .filter(|s| s.status.is_live())
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    /// Up to `limit` sessions of any status, most recently active first.
    pub fn list_recent(&self, limit: usize) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .handles()
            .iter()
            .map(|e| e.state.read().clone())
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions.truncate(limit);
        sessions
    }

    /// Drop every finished session that has no run in flight.
    #[instrument(skip(self))]
    pub fn clear_finished(&self) -> usize {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| {
                let entry = e.value();
                !entry.running.load(Ordering::SeqCst) && entry.state.read().status.is_terminal()
            })
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in &finished {
            if self.sessions.remove(id).is_some() {
                removed += 1;
            }
            self.by_conversation.retain(|_, sid| sid != id);
        }
        debug!(removed, "finished sessions cleared");
        removed
    }

    /// Number of sessions held.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are held.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn lookup(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    fn entry(&self, id: &SessionId) -> Result<Arc<SessionEntry>, RuntimeError> {
        self.lookup(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.clone()))
    }

    fn handles(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn swap_live(&self, id: &SessionId, to: SessionStatus) -> Result<(), RuntimeError> {
        let entry = self.entry(id)?;
        let mut state = entry.state.write();
        if state.status == to {
            return Ok(());
        }
        if !state.status.can_transition_to(to) {
            return Err(RuntimeError::InvalidTransition {
                from: state.status,
                to,
            });
        }
        debug!(session_id = %id, from = %state.status, %to, "session transition");
        state.status = to;
        state.last_activity = Utc::now();
        Ok(())
    }

    fn transition(
        &self,
        id: &SessionId,
        to: SessionStatus,
        apply: impl FnOnce(&mut Session),
    ) -> Result<Session, RuntimeError> {
        let entry = self.entry(id)?;
        let mut state = entry.state.write();
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(RuntimeError::InvalidTransition { from, to });
        }
        state.status = to;
        apply(&mut state);
        state.last_activity = Utc::now();
        debug!(session_id = %id, %from, %to, "session transition");
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(5)
    }

    #[test]
    fn start_binds_conversation() {
        let reg = registry();
        let conv = ConversationId::new();
        let id = reg.start(Some(conv.clone()), "Fix the build", false);

        let session = reg.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.max_iterations, 5);
        assert_eq!(session.title, "Fix the build");
        assert_eq!(reg.find_by_conversation_id(&conv), Some(id));
    }

    #[test]
    fn start_snoozed() {
        let reg = registry();
        let id = reg.start(None, "t", true);
        assert_eq!(reg.get(&id).unwrap().status, SessionStatus::Snoozed);
    }

    #[test]
    fn stop_cancels_token() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let token = reg.cancellation(&id).unwrap();

        assert!(reg.stop(&id).unwrap());
        assert!(token.is_cancelled());
        assert!(reg.is_stop_requested(&id));
        assert_eq!(reg.get(&id).unwrap().status, SessionStatus::Stopped);
    }

    #[test]
    fn stop_finished_session_is_noop() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let _ = reg.complete(&id, "done").unwrap();
        assert!(!reg.stop(&id).unwrap());
        assert_eq!(reg.get(&id).unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn stop_unknown_session() {
        let reg = registry();
        assert_matches!(
            reg.stop(&SessionId::from("sess_missing")),
            Err(RuntimeError::SessionNotFound(_))
        );
    }

    #[test]
    fn snooze_round_trip() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        reg.snooze(&id).unwrap();
        reg.snooze(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().status, SessionStatus::Snoozed);
        reg.unsnooze(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn snooze_finished_session_rejected() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let _ = reg.error(&id, "boom").unwrap();
        assert_matches!(
            reg.snooze(&id),
            Err(RuntimeError::InvalidTransition {
                from: SessionStatus::Errored,
                to: SessionStatus::Snoozed
            })
        );
    }

    #[test]
    fn complete_stores_summary() {
        let reg = registry();
        let id = reg.start(None, "t", true);
        let session = reg.complete(&id, "all green").unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.summary.as_deref(), Some("all green"));
    }

    #[test]
    fn complete_after_stop_rejected() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let _ = reg.stop(&id).unwrap();
        assert_matches!(
            reg.complete(&id, "late"),
            Err(RuntimeError::InvalidTransition { .. })
        );
    }

    #[test]
    fn revive_resets_run_state() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let _ = reg.increment_iteration(&id).unwrap();
        let old_token = reg.cancellation(&id).unwrap();
        let _ = reg.stop(&id).unwrap();

        assert!(reg.revive(&id, false));
        let session = reg.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.iteration_count, 0);
        assert!(session.summary.is_none());
        assert!(old_token.is_cancelled());
        assert!(!reg.cancellation(&id).unwrap().is_cancelled());
        assert!(!reg.is_stop_requested(&id));
    }

    #[test]
    fn revive_unknown_returns_false() {
        assert!(!registry().revive(&SessionId::from("sess_nope"), false));
    }

    #[test]
    fn revive_live_session_keeps_iterations() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let _ = reg.increment_iteration(&id).unwrap();
        assert!(reg.revive(&id, true));
        let session = reg.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Snoozed);
        assert_eq!(session.iteration_count, 1);
    }

    #[test]
    fn update_rejects_iteration_overflow() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let err = reg
            .update(
                &id,
                SessionPatch {
                    iteration_count: Some(6),
                    title: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_matches!(err, RuntimeError::IterationLimit { count: 6, max: 5 });
        // Nothing from the rejected patch was applied.
        assert_eq!(reg.get(&id).unwrap().title, "t");
    }

    #[test]
    fn update_applies_whole_patch() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let conv = ConversationId::new();
        let session = reg
            .update(
                &id,
                SessionPatch {
                    iteration_count: Some(8),
                    max_iterations: Some(10),
                    conversation_id: Some(conv.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(session.iteration_count, 8);
        assert_eq!(session.max_iterations, 10);
        assert_eq!(reg.find_by_conversation_id(&conv), Some(id));
    }

    #[test]
    fn increment_stops_at_budget() {
        let reg = SessionRegistry::new(2);
        let id = reg.start(None, "t", false);
        assert_eq!(reg.increment_iteration(&id).unwrap(), 1);
        assert_eq!(reg.increment_iteration(&id).unwrap(), 2);
        assert_matches!(
            reg.increment_iteration(&id),
            Err(RuntimeError::IterationLimit { count: 3, max: 2 })
        );
        assert_eq!(reg.get(&id).unwrap().iteration_count, 2);
    }

    #[test]
    fn bind_conversation_points_index_at_latest() {
        let reg = registry();
        let conv = ConversationId::new();
        let first = reg.start(Some(conv.clone()), "a", false);
        let second = reg.start(None, "b", false);
        reg.bind_conversation(&second, &conv).unwrap();
        assert_eq!(reg.find_by_conversation_id(&conv), Some(second));
        assert_ne!(reg.find_by_conversation_id(&conv), Some(first));
    }

    #[test]
    fn run_guard_is_exclusive() {
        let reg = registry();
        let id = reg.start(None, "t", false);
        let guard = reg.begin_run(&id).unwrap();
        assert_eq!(reg.running_count(), 1);
        assert_matches!(reg.begin_run(&id), Err(RuntimeError::SessionBusy(_)));
        drop(guard);
        assert_eq!(reg.running_count(), 0);
        assert!(reg.begin_run(&id).is_ok());
    }

    #[test]
    fn running_session_cannot_be_rebound() {
        let reg = registry();
        let conv = ConversationId::new();
        let other = ConversationId::new();
        let id = reg.start(Some(conv.clone()), "t", false);
        let guard = reg.begin_run(&id).unwrap();
        assert!(reg.is_running(&id));
        assert!(format!("{guard:?}").contains("RunGuard"));

        assert_matches!(
            reg.bind_conversation(&id, &other),
            Err(RuntimeError::SessionBusy(_))
        );
        assert_eq!(reg.get(&id).unwrap().conversation_id, Some(conv.clone()));
        assert_eq!(reg.find_by_conversation_id(&other), None);
        // Rebinding to the same conversation is harmless.
        reg.bind_conversation(&id, &conv).unwrap();

        drop(guard);
        assert!(!reg.is_running(&id));
        reg.bind_conversation(&id, &other).unwrap();
        assert_eq!(reg.find_by_conversation_id(&other), Some(id));
    }

    #[test]
    fn list_active_excludes_finished() {
        let reg = registry();
        let live = reg.start(None, "live", false);
        let snoozed = reg.start(None, "snoozed", true);
        let done = reg.start(None, "done", false);
        let _ = reg.complete(&done, "ok").unwrap();

        let active: Vec<SessionId> = reg.list_active().into_iter().map(|s| s.id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&live));
        assert!(active.contains(&snoozed));
        assert_eq!(reg.list_recent(10).len(), 3);
        assert_eq!(reg.list_recent(1).len(), 1);
    }

    #[test]
    fn list_recent_most_recent_first() {
        let reg = registry();
        let a = reg.start(None, "a", false);
        let b = reg.start(None, "b", false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        reg.snooze(&a).unwrap();
        let recent: Vec<SessionId> = reg.list_recent(2).into_iter().map(|s| s.id).collect();
        assert_eq!(recent, vec![a, b]);
    }

    #[test]
    fn clear_finished_keeps_live_and_running() {
        let reg = registry();
        let conv = ConversationId::new();
        let done = reg.start(Some(conv.clone()), "done", false);
        let _ = reg.complete(&done, "ok").unwrap();
        let live = reg.start(None, "live", false);
        let busy = reg.start(None, "busy", false);
        let _guard = reg.begin_run(&busy).unwrap();
        let _ = reg.error(&busy, "boom").unwrap();

        assert_eq!(reg.clear_finished(), 1);
        assert!(reg.get(&done).is_none());
        assert!(reg.get(&live).is_some());
        assert!(reg.get(&busy).is_some());
        assert!(reg.find_by_conversation_id(&conv).is_none());
        assert!(reg.is_stop_requested(&done));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_on_distinct_sessions() {
        let reg = Arc::new(SessionRegistry::new(100));
        let ids: Vec<SessionId> = (0..8).map(|i| reg.start(None, &format!("s{i}"), false)).collect();

        let mut handles = Vec::new();
        for id in ids.clone() {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let _ = reg.increment_iteration(&id).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for id in &ids {
            assert_eq!(reg.get(id).unwrap().iteration_count, 50);
        }
    }
}
