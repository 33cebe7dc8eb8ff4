use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::command::{Assignment, ControlCommand, Job, SlotOutcome, SlotReport};
use crate::engine::config::{DispatcherConfig, RotationPolicy};
use crate::engine::metrics::Metrics;
use crate::engine::queue::EnqueueOutcome;
use crate::engine::registry::{SessionRegistry, SessionState};
use crate::engine::ring::FairRing;
use crate::engine::stats::DispatcherStats;
use crate::engine::tracker::{CompletionTracker, Settlement};
use crate::engine::worker::WorkerPool;
use crate::error::SourceError;
use crate::message::Delivery;
use crate::source::{LockToken, SessionLock};

mod admission;
mod handlers;
mod housekeeping;

/// What the dispatcher hands back when its thread exits.
pub(crate) struct DispatcherExit {
    /// Session locks still held, for the engine to release.
    pub locks: Vec<Arc<dyn SessionLock>>,
    pub stats: DispatcherStats,
    pub leaked_slots: usize,
    /// Transport fault that ended the run, if any.
    pub fault: Option<SourceError>,
}

/// Single-threaded scheduling core. Owns every session, the fair ring and
/// the slot bookkeeping; everything else talks to it through channels.
pub(crate) struct Dispatcher {
    config: DispatcherConfig,
    idle_timeout: Duration,
    registry: SessionRegistry,
    /// Ready sessions waiting for a slot, longest-waiting first.
    ring: FairRing,
    pool: WorkerPool,
    tracker: CompletionTracker,
    jobs: UnboundedSender<Job>,
    ingest_cancel: CancellationToken,
    metrics: Metrics,
    /// False once shutdown began: no admissions, no new lock requests.
    accepting: bool,
    running: bool,
    fault: Option<SourceError>,
    max_active_observed: usize,
    last_housekeeping: Instant,
}

impl Dispatcher {
    pub(crate) fn new(
        config: &DispatcherConfig,
        jobs: UnboundedSender<Job>,
        ingest_cancel: CancellationToken,
        metrics: Metrics,
    ) -> Self {
        Self {
            config: config.clone(),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            registry: SessionRegistry::new(),
            ring: FairRing::new(),
            pool: WorkerPool::new(config.max_concurrent_sessions),
            tracker: CompletionTracker::new(),
            jobs,
            ingest_cancel,
            metrics,
            accepting: true,
            running: true,
            fault: None,
            max_active_observed: 0,
            last_housekeeping: Instant::now(),
        }
    }

    /// Run the event loop on the current thread until shutdown has drained
    /// every slot, or every control sender is gone.
    pub(crate) fn run(
        mut self,
        ingest: Receiver<Delivery>,
        control: Receiver<ControlCommand>,
    ) -> DispatcherExit {
        info!(
            max_concurrent_sessions = self.config.max_concurrent_sessions,
            rotation = ?self.config.rotation,
            quantum = self.config.quantum,
            "dispatcher started"
        );

        let mut ingest = ingest;
        while self.running {
            crossbeam_channel::select! {
                recv(control) -> cmd => match cmd {
                    Ok(cmd) => self.handle_command(cmd),
                    Err(_) => {
                        info!("control channel disconnected, stopping");
                        self.begin_shutdown();
                        self.running = false;
                    }
                },
                recv(ingest) -> delivery => match delivery {
                    Ok(delivery) => self.handle_delivery(delivery),
                    Err(_) => {
                        debug!("ingest channel closed");
                        ingest = crossbeam_channel::never();
                    }
                },
                default(self.idle_timeout) => self.housekeeping(),
            }

            // A steady stream of commands must not starve periodic work
            if self.last_housekeeping.elapsed() >= self.idle_timeout {
                self.housekeeping();
            }
            if !self.accepting && self.pool.in_use() == 0 {
                self.running = false;
            }
        }

        self.into_exit()
    }

    pub(super) fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::SlotReleased(report) => self.on_slot_released(report),
            ControlCommand::LockAcquired { session_key, lock } => {
                self.on_lock_acquired(&session_key, lock)
            }
            ControlCommand::LockUnavailable { session_key, error } => {
                self.on_lock_unavailable(&session_key, error)
            }
            ControlCommand::SessionLost(token) => self.on_session_lost(token),
            ControlCommand::TransportFault(error) => self.on_transport_fault(error),
            ControlCommand::GetStats { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControlCommand::Shutdown => {
                info!(
                    slots_in_use = self.pool.in_use(),
                    "shutdown requested, draining in-flight messages"
                );
                self.begin_shutdown();
            }
        }
    }

    pub(super) fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            sessions: self.registry.len(),
            active_sessions: self.registry.count_in(SessionState::Active),
            draining_sessions: self.registry.count_in(SessionState::Draining),
            idle_sessions: self.registry.count_in(SessionState::Idle),
            lost_sessions: self.registry.lost_count(),
            waiting_sessions: self.ring.len(),
            queued_messages: self.registry.queued_messages(),
            slots_in_use: self.pool.in_use(),
            slot_capacity: self.pool.capacity(),
            max_active_observed: self.max_active_observed,
            totals: self.tracker.totals(),
        }
    }

    fn into_exit(mut self) -> DispatcherExit {
        let stats = self.snapshot();
        let leaked_slots = self.pool.in_use();
        if leaked_slots > 0 {
            warn!(leaked_slots, "dispatcher exiting with slots still in use");
        }
        let locks = self.registry.take_locks();
        info!(
            completed = stats.totals.completed,
            dead_lettered = stats.totals.dead_lettered,
            locks = locks.len(),
            "dispatcher stopped"
        );
        DispatcherExit {
            locks,
            stats,
            leaked_slots,
            fault: self.fault.take(),
        }
    }
}

#[cfg(test)]
mod tests;
