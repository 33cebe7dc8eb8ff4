use super::*;

impl Dispatcher {
    /// Re-evaluate one session after anything about it changed: request a
    /// lock if it needs one, or queue it for a slot if it is ready.
    pub(super) fn poke(&mut self, key: &str) {
        if !self.accepting {
            return;
        }
        let Some(session) = self.registry.get(key) else {
            return;
        };

        if session.needs_lock() {
            let delay = if session.state() == SessionState::Lost {
                Duration::from_millis(self.config.lock_retry_backoff_ms)
            } else {
                Duration::ZERO
            };
            self.request_lock(key, delay);
            return;
        }

        if session.is_ready() {
            self.ring.push(key);
            self.admit_waiting();
        }
    }

    pub(super) fn request_lock(&mut self, key: &str, delay: Duration) {
        let Some(session) = self.registry.get_mut(key) else {
            return;
        };
        if !session.needs_lock() {
            return;
        }
        session.acquiring = true;
        debug!(session = %key, ?delay, "requesting session lock");
        self.send_job(Job::AcquireLock {
            session_key: key.to_string(),
            delay,
        });
    }

    /// Admit ring sessions while the budget and the pool allow it. Sessions
    /// that stopped being ready while they waited are skipped; they rejoin
    /// when they become ready again.
    pub(super) fn admit_waiting(&mut self) {
        while self.accepting
            && self.pool.has_free()
            && self.registry.admitted_count() < self.config.max_concurrent_sessions
        {
            let Some(key) = self.ring.pop() else {
                break;
            };
            if !self.registry.get(&key).is_some_and(|s| s.is_ready()) {
                continue;
            }
            self.admit(&key);
        }
    }

    /// Drop ring heads that are no longer ready and report whether a ready
    /// session is left waiting.
    pub(super) fn has_ready_waiter(&mut self) -> bool {
        while let Some(key) = self.ring.front() {
            if self.registry.get(key).is_some_and(|s| s.is_ready()) {
                return true;
            }
            let stale = key.to_string();
            debug!(session = %stale, "stale ring entry dropped");
            self.ring.pop();
        }
        false
    }

    fn admit(&mut self, key: &str) {
        self.registry.mark_active(key);
        if let Some(session) = self.registry.get_mut(key) {
            session.deficit = self.config.quantum;
        }
        self.metrics.record_admitted(key);
        self.max_active_observed = self.max_active_observed.max(self.registry.admitted_count());
        debug!(session = %key, active = self.registry.admitted_count(), "session admitted");
        self.dispatch(key);
    }

    /// Hand the head message of an Active session to a free slot.
    pub(super) fn dispatch(&mut self, key: &str) {
        let Some(slot) = self.pool.try_acquire() else {
            warn!(session = %key, "no free slot for an admitted session");
            self.registry.mark_idle(key);
            self.ring.push(key);
            return;
        };

        let prepared = self.registry.get_mut(key).and_then(|session| {
            let lock = session.lock.clone()?;
            let head = session.queue.peek_head()?;
            let lease = head.lease?;
            let message = head.message.clone();
            session.slot = Some(slot);
            Some((lock, message, lease))
        });
        let Some((lock, message, lease)) = prepared else {
            self.pool.release(slot);
            self.registry.mark_idle(key);
            return;
        };

        let epoch = lock.token().epoch;
        let attempts = self.tracker.attempts(&message);
        self.tracker.begin(message.id, key, epoch);
        debug!(%slot, session = %key, seq = message.sequence_id, attempts, "dispatching");

        let message_id = message.id;
        let sent = self.send_job(Job::Run(Assignment {
            slot,
            lock,
            message,
            lease,
            attempts,
        }));
        if !sent {
            // Nothing will ever report for this slot
            self.tracker.cancel(&message_id);
            self.pool.release(slot);
            if let Some(session) = self.registry.get_mut(key) {
                session.slot = None;
            }
            self.registry.mark_idle(key);
            self.begin_shutdown();
        }
    }

    pub(super) fn send_job(&mut self, job: Job) -> bool {
        if self.jobs.send(job).is_err() {
            error!("job runner is gone");
            return false;
        }
        true
    }
}
