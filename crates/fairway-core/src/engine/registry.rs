use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::queue::SessionQueue;
use crate::engine::worker::SlotId;
use crate::source::SessionLock;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not being worked. May or may not have ready work.
    Idle,
    /// Holds a worker slot.
    Active,
    /// Holds a worker slot while shutdown waits for its in-flight message.
    Draining,
    /// Lock revoked. Queue kept; a fresh lock is needed before resuming.
    Lost,
}

impl SessionState {
    /// States counted against the admission budget.
    pub fn is_admitted(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Draining)
    }
}

pub struct Session {
    key: String,
    pub queue: SessionQueue,
    state: SessionState,
    pub lock: Option<Arc<dyn SessionLock>>,
    /// A lock acquisition job is in flight.
    pub acquiring: bool,
    /// Slot currently running this session's head message.
    pub slot: Option<SlotId>,
    /// Messages left in the current admission under the rotate policy.
    pub deficit: u32,
    pub last_active: Instant,
}

impl Session {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            queue: SessionQueue::new(),
            state: SessionState::Idle,
            lock: None,
            acquiring: false,
            slot: None,
            deficit: 0,
            last_active: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Eligible for admission: idle, lock held, nothing in flight, head ready.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Idle
            && self.lock.is_some()
            && self.slot.is_none()
            && self.queue.head_ready()
    }

    /// Needs a lock acquisition job: no lock, none pending, and work buffered.
    pub fn needs_lock(&self) -> bool {
        self.lock.is_none() && !self.acquiring && !self.queue.is_empty()
    }

    /// Current lock epoch, if a lock is held.
    pub fn epoch(&self) -> Option<u64> {
        self.lock.as_ref().map(|l| l.token().epoch)
    }
}

/// Session key → session, plus state counters kept in step with every
/// transition. Owned by the dispatcher thread.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    admitted: usize,
    lost: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session, or a new Idle one with an empty queue. The flag is
    /// true when the session was created by this call.
    pub fn route_or_create(&mut self, session_key: &str) -> (&mut Session, bool) {
        let created = !self.sessions.contains_key(session_key);
        let session = self
            .sessions
            .entry(session_key.to_string())
            .or_insert_with(|| Session::new(session_key));
        (session, created)
    }

    pub fn get(&self, session_key: &str) -> Option<&Session> {
        self.sessions.get(session_key)
    }

    pub fn get_mut(&mut self, session_key: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_key)
    }

    /// Keys of sessions eligible for admission.
    pub fn list_idle_with_work(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.is_ready())
            .map(|s| s.key.clone())
            .collect()
    }

    pub fn mark_active(&mut self, session_key: &str) -> bool {
        self.transition(session_key, SessionState::Active)
    }

    pub fn mark_idle(&mut self, session_key: &str) -> bool {
        self.transition(session_key, SessionState::Idle)
    }

    pub fn mark_draining(&mut self, session_key: &str) -> bool {
        self.transition(session_key, SessionState::Draining)
    }

    /// Move to Lost, dropping the lock and every buffered lease.
    pub fn mark_lost(&mut self, session_key: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_key) else {
            return false;
        };
        session.lock = None;
        session.queue.clear_leases();
        self.transition(session_key, SessionState::Lost)
    }

    fn transition(&mut self, session_key: &str, next: SessionState) -> bool {
        let Some(session) = self.sessions.get_mut(session_key) else {
            return false;
        };
        let prev = session.state;
        if prev == next {
            return true;
        }
        session.state = next;
        // Retention counts from the last state change, including leaving Active
        session.last_active = Instant::now();

        match (prev.is_admitted(), next.is_admitted()) {
            (false, true) => self.admitted += 1,
            (true, false) => self.admitted -= 1,
            _ => {}
        }
        match (prev == SessionState::Lost, next == SessionState::Lost) {
            (false, true) => self.lost += 1,
            (true, false) => self.lost -= 1,
            _ => {}
        }
        true
    }

    /// Remove sessions that have been idle (or lost) with nothing buffered,
    /// nothing in flight and no pending acquisition for longer than
    /// `retention`. Returned so the caller can release their locks.
    pub fn evict_expired(&mut self, now: Instant, retention: Duration) -> Vec<Session> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| {
                !s.state.is_admitted()
                    && s.queue.is_empty()
                    && s.slot.is_none()
                    && !s.acquiring
                    && now.saturating_duration_since(s.last_active) >= retention
            })
            .map(|s| s.key.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(session) = self.sessions.remove(&key) {
                if session.state == SessionState::Lost {
                    self.lost -= 1;
                }
                evicted.push(session);
            }
        }
        evicted
    }

    /// Sessions currently counted against the budget (Active or Draining).
    pub fn admitted_count(&self) -> usize {
        self.admitted
    }

    pub fn lost_count(&self) -> usize {
        self.lost
    }

    pub fn count_in(&self, state: SessionState) -> usize {
        self.sessions.values().filter(|s| s.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn queued_messages(&self) -> usize {
        self.sessions.values().map(|s| s.queue.len()).sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Take every held lock out of the registry (shutdown).
    pub fn take_locks(&mut self) -> Vec<Arc<dyn SessionLock>> {
        self.sessions
            .values_mut()
            .filter_map(|s| s.lock.take())
            .collect()
    }
}
