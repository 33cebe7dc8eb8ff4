use std::collections::VecDeque;

use super::*;
use crate::message::OutboundMessage;

pub(super) fn test_config(budget: usize) -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent_sessions: budget,
        lock_retry_backoff_ms: 20,
        idle_timeout_ms: 10,
        ..Default::default()
    }
}

/// Drives a dispatcher synchronously, playing the job runner: lock jobs are
/// answered from a `MemorySource`, run jobs are parked until the test
/// settles them.
pub(super) struct Harness {
    pub dispatcher: Dispatcher,
    pub source: MemorySource,
    pub cancel: CancellationToken,
    pub running: VecDeque<Assignment>,
    /// Lock acquisitions requested with a backoff, held until `fire_timers`.
    pub delayed: Vec<String>,
    /// (session, sequence) in hand-off order.
    pub dispatched: Vec<(String, u64)>,
    /// (session, sequence) in completion order.
    pub handled: Vec<(String, u64)>,
    jobs: tokio::sync::mpsc::UnboundedReceiver<Job>,
    loss_tx: crossbeam_channel::Sender<LockToken>,
    loss_rx: crossbeam_channel::Receiver<LockToken>,
}

impl Harness {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_source(config, MemorySourceConfig::default())
    }

    pub fn with_source(config: DispatcherConfig, source_config: MemorySourceConfig) -> Self {
        Self::build(config, source_config, Metrics::new())
    }

    pub fn with_metrics(config: DispatcherConfig, metrics: Metrics) -> Self {
        Self::build(config, MemorySourceConfig::default(), metrics)
    }

    fn build(config: DispatcherConfig, source_config: MemorySourceConfig, metrics: Metrics) -> Self {
        let (jobs_tx, jobs) = tokio::sync::mpsc::unbounded_channel();
        let (loss_tx, loss_rx) = crossbeam_channel::unbounded();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(&config, jobs_tx, cancel.clone(), metrics);
        Self {
            dispatcher,
            source: MemorySource::new(source_config),
            cancel,
            running: VecDeque::new(),
            delayed: Vec::new(),
            dispatched: Vec::new(),
            handled: Vec::new(),
            jobs,
            loss_tx,
            loss_rx,
        }
    }

    pub fn publish(&self, session_key: &str, count: usize) {
        for i in 0..count {
            self.source
                .send(OutboundMessage::new(
                    session_key,
                    format!("{session_key}-{i}").into_bytes(),
                    "text/plain",
                ))
                .unwrap();
        }
    }

    /// Route everything the source has available, then answer jobs.
    pub fn pump(&mut self) {
        let batch = self.source.receive(10_000, Duration::ZERO).unwrap();
        for delivery in batch {
            self.dispatcher.handle_delivery(delivery);
        }
        self.run_jobs();
    }

    pub fn run_jobs(&mut self) {
        while let Ok(job) = self.jobs.try_recv() {
            match job {
                Job::Run(assignment) => {
                    self.dispatched.push((
                        assignment.message.session_key.clone(),
                        assignment.message.sequence_id,
                    ));
                    self.running.push_back(assignment);
                }
                Job::AcquireLock { session_key, delay } if !delay.is_zero() => {
                    self.delayed.push(session_key);
                }
                Job::AcquireLock { session_key, .. } => self.acquire(session_key),
                Job::ReleaseLock(lock) => {
                    let _ = lock.release();
                }
            }
        }
    }

    fn acquire(&mut self, session_key: String) {
        let tx = self.loss_tx.clone();
        let result = self.source.accept_session(
            &session_key,
            Arc::new(move |token| {
                let _ = tx.send(token);
            }),
        );
        let cmd = match result {
            Ok(lock) => ControlCommand::LockAcquired { session_key, lock },
            Err(error) => ControlCommand::LockUnavailable { session_key, error },
        };
        self.dispatcher.handle_command(cmd);
    }

    /// Let backed-off lock acquisitions go through.
    pub fn fire_timers(&mut self) {
        for key in std::mem::take(&mut self.delayed) {
            self.acquire(key);
        }
        self.run_jobs();
    }

    pub fn deliver_losses(&mut self) {
        while let Ok(token) = self.loss_rx.try_recv() {
            self.dispatcher.handle_command(ControlCommand::SessionLost(token));
        }
        self.run_jobs();
    }

    /// Complete the oldest in-flight message at the source and report it.
    pub fn complete_next(&mut self) -> Option<SlotOutcome> {
        let assignment = self.running.pop_front()?;
        let outcome = match self
            .source
            .complete(&assignment.lock.token(), &assignment.lease)
        {
            Ok(()) => {
                self.handled.push((
                    assignment.message.session_key.clone(),
                    assignment.message.sequence_id,
                ));
                SlotOutcome::Completed
            }
            Err(SourceError::SessionLockLost(_)) => SlotOutcome::LockLost,
            Err(SourceError::LeaseNotFound(_)) => SlotOutcome::LeaseLost,
            Err(e) => SlotOutcome::SettleFailed {
                error: e.to_string(),
            },
        };
        self.report(&assignment, outcome.clone());
        Some(outcome)
    }

    /// Abandon the oldest in-flight message at the source and report it.
    pub fn fail_next(&mut self) -> Option<Assignment> {
        let assignment = self.running.pop_front()?;
        self.source.abandon(&assignment.lease).unwrap();
        self.report(
            &assignment,
            SlotOutcome::Abandoned {
                error: "handler failed".to_string(),
            },
        );
        Some(assignment)
    }

    pub fn report(&mut self, assignment: &Assignment, outcome: SlotOutcome) {
        let token = assignment.lock.token();
        let report = SlotReport {
            slot: assignment.slot,
            session_key: token.session_key,
            epoch: token.epoch,
            message_id: assignment.message.id,
            lease: assignment.lease,
            outcome,
        };
        self.dispatcher
            .handle_command(ControlCommand::SlotReleased(report));
        self.run_jobs();
    }

    /// Complete everything, pulling redeliveries as they appear, asserting
    /// the budget after every step.
    pub fn run_to_idle(&mut self, budget: usize) {
        for _ in 0..100_000 {
            self.assert_budget(budget);
            if self.complete_next().is_none() {
                self.pump();
                self.fire_timers();
                if self.running.is_empty() {
                    return;
                }
            }
        }
        panic!("dispatcher did not go idle");
    }

    pub fn assert_budget(&self, budget: usize) {
        let admitted = self.dispatcher.registry.admitted_count();
        assert!(admitted <= budget, "{admitted} sessions admitted, budget {budget}");
        assert!(self.running.len() <= budget);
        assert_eq!(self.running.len(), self.dispatcher.pool.in_use());
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.snapshot()
    }

    pub fn handled_for(&self, session_key: &str) -> Vec<u64> {
        self.handled
            .iter()
            .filter(|(k, _)| k == session_key)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn dispatched_for(&self, session_key: &str) -> Vec<u64> {
        self.dispatched
            .iter()
            .filter(|(k, _)| k == session_key)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn exit(self) -> DispatcherExit {
        self.dispatcher.into_exit()
    }
}
