use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::engine::stats::DispatcherStats;
use crate::engine::worker::SlotId;
use crate::error::SourceError;
use crate::message::{LeaseToken, Message};
use crate::source::{LockToken, SessionLock};

/// Control-plane commands sent to the single-threaded dispatcher by worker
/// tasks, the source's loss notifier, the ingestion thread and the engine
/// handle. Message arrivals travel on a separate bounded channel.
pub enum ControlCommand {
    SlotReleased(SlotReport),
    LockAcquired {
        session_key: String,
        lock: Arc<dyn SessionLock>,
    },
    LockUnavailable {
        session_key: String,
        error: SourceError,
    },
    SessionLost(LockToken),
    TransportFault(SourceError),
    GetStats {
        reply: tokio::sync::oneshot::Sender<DispatcherStats>,
    },
    Shutdown,
}

/// Work handed from the dispatcher thread to the async job runner.
pub enum Job {
    Run(Assignment),
    AcquireLock {
        session_key: String,
        delay: Duration,
    },
    ReleaseLock(Arc<dyn SessionLock>),
}

/// One message of one session bound to one worker slot.
pub struct Assignment {
    pub slot: SlotId,
    pub lock: Arc<dyn SessionLock>,
    pub message: Message,
    pub lease: LeaseToken,
    /// 1-based attempt number of this delivery, for the dead-letter policy.
    pub attempts: u32,
}

/// How a slot run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Handler succeeded and the source acknowledged the message.
    Completed,
    /// Handler failed; the message was returned to the source for redelivery.
    Abandoned { error: String },
    /// Handler failed too often; the message was moved aside.
    DeadLettered { reason: String },
    /// The session lock was gone before the message could be settled.
    LockLost,
    /// The message lease expired before settlement.
    LeaseLost,
    /// The source failed while settling; the message state is unknown.
    SettleFailed { error: String },
}

impl SlotOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SlotOutcome::Completed | SlotOutcome::DeadLettered { .. })
    }
}

/// Worker → dispatcher report emitted when a slot finishes.
#[derive(Debug, Clone)]
pub struct SlotReport {
    pub slot: SlotId,
    pub session_key: String,
    pub epoch: u64,
    pub message_id: Uuid,
    pub lease: LeaseToken,
    pub outcome: SlotOutcome,
}
