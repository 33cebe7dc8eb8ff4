use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::command::{Assignment, ControlCommand, Job, SlotOutcome, SlotReport};
use crate::engine::handler::MessageHandler;
use crate::engine::policy::{DeadLetterPolicy, FailureAction};
use crate::error::{HandlerError, SourceError};
use crate::message::{LeaseToken, Message};
use crate::source::{LockToken, LossNotifier, MessageSource, SessionLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Fixed set of execution slots. Bookkeeping only; the dispatcher thread
/// owns it and the work itself runs on the job runner.
pub struct WorkerPool {
    free: VecDeque<SlotId>,
    busy: Vec<bool>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).map(SlotId).collect(),
            busy: vec![false; capacity],
        }
    }

    /// A free slot, or `None` when all are busy. Callers park the session in
    /// the fair ring until a slot is released.
    pub fn try_acquire(&mut self) -> Option<SlotId> {
        let slot = self.free.pop_front()?;
        self.busy[slot.0] = true;
        Some(slot)
    }

    /// Returns false for a slot that was not acquired.
    pub fn release(&mut self, slot: SlotId) -> bool {
        match self.busy.get_mut(slot.0) {
            Some(busy) if *busy => {
                *busy = false;
                self.free.push_back(slot);
                true
            }
            _ => false,
        }
    }

    pub fn in_use(&self) -> usize {
        self.busy.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.busy.len()
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }
}

/// Everything a job needs, shared by all jobs of one engine.
pub(crate) struct WorkerContext {
    pub source: Arc<dyn MessageSource>,
    pub handler: Arc<dyn MessageHandler>,
    pub policy: Arc<dyn DeadLetterPolicy>,
    pub control: Sender<ControlCommand>,
    pub handler_timeout: Duration,
    /// Cancelled when shutdown begins; pending lock retries give up.
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    /// Run jobs until the dispatcher drops its sender, then wait for the
    /// jobs still in flight.
    pub(crate) async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<Job>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => {
                        let ctx = Arc::clone(&self);
                        tasks.spawn(async move { ctx.execute(job).await });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        debug!("job runner stopped");
    }

    async fn execute(&self, job: Job) {
        match job {
            Job::Run(assignment) => self.run_slot(assignment).await,
            Job::AcquireLock { session_key, delay } => self.acquire_lock(session_key, delay).await,
            Job::ReleaseLock(lock) => {
                let token = lock.token();
                if let Err(e) = lock.release() {
                    warn!(lock = %token, error = %e, "failed to release session lock");
                }
            }
        }
    }

    async fn run_slot(&self, assignment: Assignment) {
        let Assignment {
            slot,
            lock,
            message,
            lease,
            attempts,
        } = assignment;
        let token = lock.token();

        let outcome = self
            .process(lock.as_ref(), &token, &message, &lease, attempts)
            .await;
        debug!(%slot, session = %token.session_key, msg_id = %message.id, ?outcome, "slot finished");

        let report = SlotReport {
            slot,
            session_key: token.session_key,
            epoch: token.epoch,
            message_id: message.id,
            lease,
            outcome,
        };
        if self.control.send(ControlCommand::SlotReleased(report)).is_err() {
            warn!(%slot, "dispatcher gone, slot report dropped");
        }
    }

    async fn process(
        &self,
        lock: &dyn SessionLock,
        token: &LockToken,
        message: &Message,
        lease: &LeaseToken,
        attempts: u32,
    ) -> SlotOutcome {
        if let Err(e) = lock.renew() {
            return settle_error(e);
        }

        let err = match self.invoke(message).await {
            Ok(()) => {
                return match self.source.complete(token, lease) {
                    Ok(()) => SlotOutcome::Completed,
                    Err(e) => settle_error(e),
                };
            }
            Err(err) => err,
        };

        // The source already reclaimed every lease of a lost session
        if lock.is_lost() {
            warn!(session = %token.session_key, msg_id = %message.id, error = %err, "handler failed after session lock was lost");
            return SlotOutcome::LockLost;
        }

        match self.policy.on_failure(message, attempts, &err) {
            FailureAction::Retry => {
                warn!(session = %token.session_key, msg_id = %message.id, attempts, error = %err, "handler failed, abandoning");
                match self.source.abandon(lease) {
                    Ok(()) => SlotOutcome::Abandoned {
                        error: err.to_string(),
                    },
                    Err(e) => settle_error(e),
                }
            }
            FailureAction::DeadLetter => {
                let reason = format!("{err} (after {attempts} attempts)");
                error!(session = %token.session_key, msg_id = %message.id, %reason, "dead-lettering message");
                match self.source.dead_letter(token, lease, &reason) {
                    Ok(()) => SlotOutcome::DeadLettered { reason },
                    Err(e) => settle_error(e),
                }
            }
        }
    }

    /// Run the handler in its own task so a panic or a timeout cannot take
    /// the slot down with it.
    async fn invoke(&self, message: &Message) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        let owned = message.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned).await });

        match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(HandlerError::Failed(format!("handler panicked: {join}"))),
            Err(_) => {
                task.abort();
                Err(HandlerError::TimedOut(self.handler_timeout))
            }
        }
    }

    async fn acquire_lock(&self, session_key: String, delay: Duration) {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    let _ = self.control.send(ControlCommand::LockUnavailable {
                        session_key,
                        error: SourceError::Closed,
                    });
                    return;
                }
            }
        }

        let control = self.control.clone();
        let on_lost: LossNotifier = Arc::new(move |token| {
            let _ = control.send(ControlCommand::SessionLost(token));
        });

        match self.source.accept_session(&session_key, on_lost) {
            Ok(lock) => {
                debug!(lock = %lock.token(), "session lock acquired");
                let sent = self.control.send(ControlCommand::LockAcquired {
                    session_key,
                    lock: Arc::clone(&lock),
                });
                if sent.is_err() {
                    let _ = lock.release();
                }
            }
            Err(error) => {
                debug!(session = %session_key, %error, "session lock not acquired");
                let _ = self
                    .control
                    .send(ControlCommand::LockUnavailable { session_key, error });
            }
        }
    }
}

fn settle_error(e: SourceError) -> SlotOutcome {
    match e {
        SourceError::SessionLockLost(_) => SlotOutcome::LockLost,
        SourceError::LeaseNotFound(_) => SlotOutcome::LeaseLost,
        other => SlotOutcome::SettleFailed {
            error: other.to_string(),
        },
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "job panicked");
        } else {
            info!(error = %e, "job cancelled");
        }
    }
}
