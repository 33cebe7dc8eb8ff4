use crate::engine::tracker::TrackerTotals;

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub sessions: usize,
    pub active_sessions: usize,
    pub draining_sessions: usize,
    pub idle_sessions: usize,
    pub lost_sessions: usize,
    /// Sessions in the fair ring waiting for a slot.
    pub waiting_sessions: usize,
    pub queued_messages: usize,
    pub slots_in_use: usize,
    pub slot_capacity: usize,
    /// Highest number of simultaneously admitted sessions seen so far.
    pub max_active_observed: usize,
    pub totals: TrackerTotals,
}

/// Returned once the engine has fully stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Worker slots still held when the dispatcher exited. Zero unless a
    /// worker never reported back.
    pub leaked_slots: usize,
    pub locks_released: usize,
    pub stats: DispatcherStats,
}
