use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// OTel instruments recorded by the dispatcher thread.
#[derive(Clone)]
pub struct Metrics {
    pub messages_ingested: Counter<u64>,
    pub messages_completed: Counter<u64>,
    pub messages_abandoned: Counter<u64>,
    pub messages_dead_lettered: Counter<u64>,
    pub messages_deferred: Counter<u64>,
    pub sessions_admitted: Counter<u64>,
    pub sessions_lost: Counter<u64>,
    pub sessions_active: Gauge<u64>,
    pub sessions_waiting: Gauge<u64>,
    pub queue_depth: Gauge<u64>,
    pub slots_in_use: Gauge<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Instruments from the global meter provider; no-op when none is installed.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("fairway");
        Self::from_meter(&meter)
    }

    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_ingested: meter
                .u64_counter("fairway.messages.ingested")
                .with_description("Deliveries received from the message source")
                .build(),
            messages_completed: meter
                .u64_counter("fairway.messages.completed")
                .with_description("Messages handled and acknowledged")
                .build(),
            messages_abandoned: meter
                .u64_counter("fairway.messages.abandoned")
                .with_description("Messages returned to the source after a handler failure")
                .build(),
            messages_dead_lettered: meter
                .u64_counter("fairway.messages.dead_lettered")
                .with_description("Messages moved to the dead-letter store")
                .build(),
            messages_deferred: meter
                .u64_counter("fairway.messages.deferred")
                .with_description("Deliveries turned away by the per-session depth cap")
                .build(),
            sessions_admitted: meter
                .u64_counter("fairway.sessions.admitted")
                .with_description("Session admissions to a worker slot")
                .build(),
            sessions_lost: meter
                .u64_counter("fairway.sessions.lost")
                .with_description("Session locks revoked by the source")
                .build(),
            sessions_active: meter
                .u64_gauge("fairway.sessions.active")
                .with_description("Sessions currently holding a worker slot")
                .build(),
            sessions_waiting: meter
                .u64_gauge("fairway.sessions.waiting")
                .with_description("Sessions with ready work waiting for a slot")
                .build(),
            queue_depth: meter
                .u64_gauge("fairway.queue.depth")
                .with_description("Messages buffered across all sessions")
                .build(),
            slots_in_use: meter
                .u64_gauge("fairway.slots.in_use")
                .with_description("Worker slots currently running a handler")
                .build(),
        }
    }

    pub fn record_ingested(&self, session_key: &str) {
        self.messages_ingested.add(1, &session(session_key));
    }

    pub fn record_completed(&self, session_key: &str) {
        self.messages_completed.add(1, &session(session_key));
    }

    pub fn record_abandoned(&self, session_key: &str) {
        self.messages_abandoned.add(1, &session(session_key));
    }

    pub fn record_dead_lettered(&self, session_key: &str) {
        self.messages_dead_lettered.add(1, &session(session_key));
    }

    pub fn record_deferred(&self, session_key: &str) {
        self.messages_deferred.add(1, &session(session_key));
    }

    pub fn record_admitted(&self, session_key: &str) {
        self.sessions_admitted.add(1, &session(session_key));
    }

    pub fn record_lost(&self, session_key: &str) {
        self.sessions_lost.add(1, &session(session_key));
    }

    pub fn set_gauges(&self, active: u64, waiting: u64, depth: u64, slots: u64) {
        self.sessions_active.record(active, &[]);
        self.sessions_waiting.record(waiting, &[]);
        self.queue_depth.record(depth, &[]);
        self.slots_in_use.record(slots, &[]);
    }
}

fn session(session_key: &str) -> [KeyValue; 1] {
    [KeyValue::new("session_key", session_key.to_string())]
}
