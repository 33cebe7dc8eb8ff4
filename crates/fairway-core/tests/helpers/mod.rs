#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fairway_core::{
    Engine, EngineConfig, HandlerError, MemorySource, Message, MessageHandler, MessageSource,
    OutboundMessage,
};
use parking_lot::Mutex;

/// Handler that records every invocation and how many ran at once.
#[derive(Default)]
pub struct Recorder {
    work: Duration,
    log: Mutex<Vec<(String, u64)>>,
    fail_once: Mutex<HashSet<(String, u64)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Recorder {
    pub fn with_work(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            ..Default::default()
        })
    }

    /// The first delivery of `(session, sequence)` fails.
    pub fn fail_once(&self, session_key: &str, sequence_id: u64) {
        self.fail_once
            .lock()
            .insert((session_key.to_string(), sequence_id));
    }

    /// (session, sequence) in invocation order, duplicates included.
    pub fn log(&self) -> Vec<(String, u64)> {
        self.log.lock().clone()
    }

    pub fn handled(&self) -> usize {
        self.log.lock().len()
    }

    pub fn sequences(&self, session_key: &str) -> Vec<u64> {
        self.log
            .lock()
            .iter()
            .filter(|(k, _)| k == session_key)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log
            .lock()
            .push((message.session_key.clone(), message.sequence_id));

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        let fail = self
            .fail_once
            .lock()
            .remove(&(message.session_key.clone(), message.sequence_id));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if fail {
            return Err(HandlerError::Failed(format!(
                "{} - {} rejected",
                message.session_key, message.sequence_id
            )));
        }
        Ok(())
    }
}

pub fn config(budget: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.dispatcher.max_concurrent_sessions = budget;
    config.dispatcher.idle_timeout_ms = 5;
    config.dispatcher.lock_retry_backoff_ms = 10;
    config.ingest.receive_wait_ms = 5;
    config.ingest.max_batch = 1_000;
    config
}

pub fn publish(source: &MemorySource, session_key: &str, count: usize) {
    for i in 0..count {
        source
            .send(OutboundMessage::new(
                session_key,
                format!("{session_key}-{i}").into_bytes(),
                "text/plain",
            ))
            .expect("send");
    }
}

pub fn start(config: EngineConfig, source: &Arc<MemorySource>, handler: &Arc<Recorder>) -> Engine {
    Engine::start(config, source.clone(), handler.clone()).expect("engine start")
}

/// Poll until `done` holds, failing the test after ten seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Acknowledged sequence ids per session, in acknowledgement order.
pub fn completed_by_session(source: &MemorySource) -> HashMap<String, Vec<u64>> {
    let mut by_session: HashMap<String, Vec<u64>> = HashMap::new();
    for message in source.completed() {
        by_session
            .entry(message.session_key)
            .or_default()
            .push(message.sequence_id);
    }
    by_session
}
