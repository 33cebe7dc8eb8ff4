use super::*;

impl Dispatcher {
    /// Route one delivery to its session queue.
    pub(super) fn handle_delivery(&mut self, delivery: Delivery) {
        let session_key = delivery.message.session_key.clone();
        self.metrics.record_ingested(&session_key);

        if !self.accepting {
            // Left to the source; the lease expires after shutdown
            debug!(session = %session_key, msg_id = %delivery.message.id, "delivery ignored while draining");
            return;
        }

        let max_depth = self.config.max_queue_depth;
        let (session, created) = self.registry.route_or_create(&session_key);
        if created {
            debug!(session = %session_key, "session created");
        }
        match session.queue.enqueue(delivery, max_depth) {
            EnqueueOutcome::Appended | EnqueueOutcome::Refreshed => {}
            EnqueueOutcome::Deferred => {
                debug!(session = %session_key, "queue at depth cap, delivery deferred");
                self.metrics.record_deferred(&session_key);
            }
        }

        self.poke(&session_key);
    }

    pub(super) fn on_slot_released(&mut self, report: SlotReport) {
        let key = report.session_key.clone();
        let current_epoch = self.registry.get(&key).and_then(|s| s.epoch());
        let settlement = self.tracker.settle(&report, current_epoch);
        if settlement == Settlement::Ignore {
            // The slot may already serve another message
            return;
        }
        if !self.pool.release(report.slot) {
            warn!(slot = %report.slot, "release for a slot that was not in use");
        }

        let Some(session) = self.registry.get_mut(&key) else {
            self.admit_waiting();
            return;
        };
        if session.slot == Some(report.slot) {
            session.slot = None;
        }

        match settlement {
            Settlement::Ignore => return,
            Settlement::Dequeue => {
                session.queue.dequeue(&report.message_id);
                match report.outcome {
                    SlotOutcome::Completed => self.metrics.record_completed(&key),
                    SlotOutcome::DeadLettered { .. } => self.metrics.record_dead_lettered(&key),
                    _ => {}
                }
            }
            Settlement::AwaitRedelivery => {
                session.queue.clear_lease(&report.lease);
                if matches!(report.outcome, SlotOutcome::Abandoned { .. }) {
                    self.metrics.record_abandoned(&key);
                }
            }
            Settlement::Retire => {
                self.retire(&key);
                self.admit_waiting();
                return;
            }
        }

        self.rotate(&key, report.outcome.is_success());
        self.admit_waiting();
    }

    /// Decide whether a session that just finished a message keeps its slot.
    fn rotate(&mut self, key: &str, succeeded: bool) {
        let quantum = self.config.quantum;
        let rotation = self.config.rotation;
        let accepting = self.accepting;
        let nobody_waiting = !self.has_ready_waiter();

        let Some(session) = self.registry.get_mut(key) else {
            return;
        };
        let state = session.state();
        if !state.is_admitted() {
            // Lost while in flight: the slot is back, reacquisition takes over
            self.poke(key);
            return;
        }

        let has_more = session.lock.is_some() && session.queue.head_ready();
        if state == SessionState::Active && accepting && succeeded && has_more {
            session.deficit = session.deficit.saturating_sub(1);
            let keep = match rotation {
                RotationPolicy::Drain => true,
                RotationPolicy::Rotate => session.deficit > 0 || nobody_waiting,
            };
            if keep {
                if session.deficit == 0 {
                    session.deficit = quantum;
                }
                self.dispatch(key);
                return;
            }
            debug!(session = %key, "quantum spent, yielding slot");
        }

        self.registry.mark_idle(key);
        self.park_if_drained(key);
        self.poke(key);
    }

    /// An idle session with nothing buffered gives its lock back.
    fn park_if_drained(&mut self, key: &str) {
        let Some(session) = self.registry.get_mut(key) else {
            return;
        };
        if session.state() != SessionState::Idle || !session.queue.is_empty() {
            return;
        }
        if let Some(lock) = session.lock.take() {
            debug!(lock = %lock.token(), "session drained, releasing lock");
            self.send_job(Job::ReleaseLock(lock));
        }
    }

    pub(super) fn on_lock_acquired(&mut self, key: &str, lock: Arc<dyn SessionLock>) {
        let accepting = self.accepting;
        let Some(session) = self.registry.get_mut(key) else {
            self.send_job(Job::ReleaseLock(lock));
            return;
        };
        session.acquiring = false;
        if !accepting || session.lock.is_some() || session.queue.is_empty() {
            self.send_job(Job::ReleaseLock(lock));
            return;
        }

        let token = lock.token();
        session.lock = Some(lock);
        if session.state() == SessionState::Lost {
            info!(lock = %token, "session lock reacquired");
            self.registry.mark_idle(key);
        } else {
            debug!(lock = %token, "session lock granted");
        }
        self.poke(key);
    }

    pub(super) fn on_lock_unavailable(&mut self, key: &str, error: SourceError) {
        let Some(session) = self.registry.get_mut(key) else {
            return;
        };
        session.acquiring = false;
        if !self.accepting {
            return;
        }
        if matches!(error, SourceError::Transport(_)) {
            self.on_transport_fault(error);
            return;
        }
        warn!(session = %key, %error, "session lock unavailable, will retry");
        let backoff = Duration::from_millis(self.config.lock_retry_backoff_ms);
        self.request_lock(key, backoff);
    }

    pub(super) fn on_session_lost(&mut self, token: LockToken) {
        let current = self.registry.get(&token.session_key).and_then(|s| s.epoch());
        if current != Some(token.epoch) {
            debug!(lock = %token, "loss notice for an old lock ignored");
            return;
        }
        self.retire(&token.session_key);
        self.admit_waiting();
    }

    /// Move a session to Lost. Its queue is kept; an in-flight slot comes
    /// back with the worker's report.
    pub(super) fn retire(&mut self, key: &str) {
        let epoch = self.registry.get(key).and_then(|s| s.epoch());
        self.ring.remove(key);
        self.registry.mark_lost(key);
        self.tracker.record_loss();
        self.metrics.record_lost(key);
        warn!(session = %key, ?epoch, "session lock lost, waiting to reacquire");
        self.poke(key);
    }

    pub(super) fn on_transport_fault(&mut self, error: SourceError) {
        error!(%error, "transport fault, shutting down");
        self.fault.get_or_insert(error);
        self.begin_shutdown();
    }

    /// Stop admitting and let in-flight messages finish. The run loop exits
    /// once every slot is back.
    pub(super) fn begin_shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        self.ingest_cancel.cancel();
        self.ring.clear();

        let active: Vec<String> = self
            .registry
            .keys()
            .into_iter()
            .filter(|k| {
                self.registry
                    .get(k)
                    .is_some_and(|s| s.state() == SessionState::Active)
            })
            .collect();
        for key in &active {
            self.registry.mark_draining(key);
        }
        info!(draining = active.len(), "dispatcher draining");
    }
}
