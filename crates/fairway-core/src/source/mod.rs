pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SourceResult;
use crate::message::{Delivery, LeaseToken, MessageReceipt, OutboundMessage};

pub use memory::{MemorySource, MemorySourceConfig};

/// Identity of one exclusive hold on a session. `epoch` increases every time
/// the session lock is (re-)acquired, so reports from an older hold can be
/// told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub session_key: String,
    pub epoch: u64,
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_key, self.epoch)
    }
}

/// Callback invoked by the source when it revokes a session lock.
pub type LossNotifier = Arc<dyn Fn(LockToken) + Send + Sync>;

/// Capability object for an exclusive session lock.
pub trait SessionLock: Send + Sync {
    fn token(&self) -> LockToken;

    /// Extend the lock. Fails with `SessionLockLost` once the lock is gone.
    fn renew(&self) -> SourceResult<()>;

    /// Give the lock back. Releasing a lock that is already lost is not an error.
    fn release(&self) -> SourceResult<()>;

    /// Local check, no renewal. Workers consult it before settling a failure.
    fn is_lost(&self) -> bool;
}

/// The transport the dispatcher consumes from. All calls are synchronous and
/// may perform I/O; the dispatcher thread never calls them, only the
/// ingestion thread and worker tasks do.
pub trait MessageSource: Send + Sync {
    fn send(&self, message: OutboundMessage) -> SourceResult<MessageReceipt>;

    /// Peek-lock up to `max_messages` available messages across all sessions,
    /// waiting at most `wait` for the first one.
    fn receive(&self, max_messages: usize, wait: Duration) -> SourceResult<Vec<Delivery>>;

    /// Acknowledge a message. Requires both the message lease and the current
    /// session lock to be valid.
    fn complete(&self, lock: &LockToken, lease: &LeaseToken) -> SourceResult<()>;

    /// Return a message to the source for redelivery.
    fn abandon(&self, lease: &LeaseToken) -> SourceResult<()>;

    fn dead_letter(&self, lock: &LockToken, lease: &LeaseToken, reason: &str) -> SourceResult<()>;

    fn accept_session(
        &self,
        session_key: &str,
        on_lost: LossNotifier,
    ) -> SourceResult<Arc<dyn SessionLock>>;

    fn close(&self) -> SourceResult<()>;
}
