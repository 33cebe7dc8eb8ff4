use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::engine::command::{SlotOutcome, SlotReport};
use crate::message::Message;

/// What the dispatcher should do with a session after a slot report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The message is settled; remove it from the session queue.
    Dequeue,
    /// Keep the message at the head and wait for the source to redeliver it.
    AwaitRedelivery,
    /// The session lock is gone; move the session to Lost.
    Retire,
    /// Duplicate report for a message that is not in flight.
    Ignore,
}

/// Running outcome totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerTotals {
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub lost: u64,
    pub stale: u64,
    pub duplicates: u64,
}

struct InFlight {
    session_key: String,
    epoch: u64,
}

/// Records outcomes per message and turns them into dispatcher decisions.
///
/// A message id is registered when it is handed to a slot and forgotten on
/// the first report, so a second report for the same hand-off is ignored.
#[derive(Default)]
pub struct CompletionTracker {
    in_flight: HashMap<Uuid, InFlight>,
    /// Abandons seen per buffered message. Covers sources that do not count
    /// redeliveries themselves.
    abandons: HashMap<Uuid, u32>,
    totals: TrackerTotals,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, message_id: Uuid, session_key: &str, epoch: u64) {
        self.in_flight.insert(
            message_id,
            InFlight {
                session_key: session_key.to_string(),
                epoch,
            },
        );
    }

    /// 1-based attempt number for the next hand-off of `message`.
    pub fn attempts(&self, message: &Message) -> u32 {
        let abandons = self.abandons.get(&message.id).copied().unwrap_or(0);
        message.delivery_count.max(abandons).saturating_add(1)
    }

    /// Settle a slot report. `current_epoch` is the epoch of the lock the
    /// session holds now, if any.
    pub fn settle(&mut self, report: &SlotReport, current_epoch: Option<u64>) -> Settlement {
        let Some(entry) = self.in_flight.remove(&report.message_id) else {
            self.totals.duplicates += 1;
            debug!(msg_id = %report.message_id, session = %report.session_key, "duplicate slot report ignored");
            return Settlement::Ignore;
        };
        debug_assert_eq!(entry.session_key, report.session_key);

        let stale = current_epoch != Some(entry.epoch);
        match &report.outcome {
            // The source accepted the settlement, whatever happened to the
            // lock afterwards.
            SlotOutcome::Completed => {
                self.totals.completed += 1;
                self.abandons.remove(&report.message_id);
                Settlement::Dequeue
            }
            SlotOutcome::DeadLettered { .. } => {
                self.totals.dead_lettered += 1;
                self.abandons.remove(&report.message_id);
                Settlement::Dequeue
            }
            SlotOutcome::Abandoned { .. } => {
                self.totals.abandoned += 1;
                *self.abandons.entry(report.message_id).or_insert(0) += 1;
                if stale {
                    self.totals.stale += 1;
                }
                Settlement::AwaitRedelivery
            }
            SlotOutcome::LeaseLost | SlotOutcome::SettleFailed { .. } => {
                if stale {
                    self.totals.stale += 1;
                }
                Settlement::AwaitRedelivery
            }
            SlotOutcome::LockLost if !stale => Settlement::Retire,
            SlotOutcome::LockLost => {
                self.totals.stale += 1;
                Settlement::AwaitRedelivery
            }
        }
    }

    /// Withdraw a hand-off that never reached a worker.
    pub fn cancel(&mut self, message_id: &Uuid) {
        self.in_flight.remove(message_id);
    }

    /// Count a session lock loss.
    pub fn record_loss(&mut self) {
        self.totals.lost += 1;
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn totals(&self) -> TrackerTotals {
        self.totals
    }
}
