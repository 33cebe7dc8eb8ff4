use super::*;

impl Dispatcher {
    /// Periodic work: forget long-idle sessions, retry lock acquisitions
    /// that fell through, refresh gauges.
    pub(super) fn housekeeping(&mut self) {
        let now = Instant::now();
        self.last_housekeeping = now;

        if self.accepting {
            self.evict_idle_sessions(now);

            let stalled: Vec<String> = self
                .registry
                .keys()
                .into_iter()
                .filter(|k| self.registry.get(k).is_some_and(|s| s.needs_lock()))
                .collect();
            for key in stalled {
                self.poke(&key);
            }

            for key in self.registry.list_idle_with_work() {
                if !self.ring.contains(&key) {
                    debug!(session = %key, "ready session was not waiting, requeued");
                    self.ring.push(&key);
                }
            }
            self.admit_waiting();
        }

        self.record_gauges();
    }

    fn evict_idle_sessions(&mut self, now: Instant) {
        let Some(retention_ms) = self.config.session_retention_ms else {
            return;
        };
        let evicted = self
            .registry
            .evict_expired(now, Duration::from_millis(retention_ms));
        for mut session in evicted {
            self.ring.remove(session.key());
            if let Some(lock) = session.lock.take() {
                self.send_job(Job::ReleaseLock(lock));
            }
            debug!(session = %session.key(), "idle session evicted");
        }
    }

    pub(super) fn record_gauges(&self) {
        self.metrics.set_gauges(
            self.registry.admitted_count() as u64,
            self.ring.len() as u64,
            self.registry.queued_messages() as u64,
            self.pool.in_use() as u64,
        );
    }
}
