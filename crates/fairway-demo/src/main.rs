use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use fairway_core::{
    Codec, Engine, EngineConfig, EntityChange, HandlerError, JsonCodec, MemorySource, Message,
    MessageHandler, MessageSource, OutboundMessage,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "fairway-demo",
    about = "One heavy tenant and several light ones sharing a small worker budget"
)]
struct Cli {
    /// Configuration file (default: fairway.toml, then /etc/fairway/fairway.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Messages for the heavy session "A"
    #[arg(long, default_value = "100")]
    heavy: u64,

    /// Messages for each light session
    #[arg(long, default_value = "10")]
    light: u64,

    /// Light session keys
    #[arg(long, value_delimiter = ',', default_value = "B,C,D,E")]
    sessions: Vec<String>,

    /// Overrides dispatcher.max_concurrent_sessions
    #[arg(long)]
    max_concurrent_sessions: Option<usize>,

    /// Simulated work per message, in milliseconds
    #[arg(long, default_value = "20")]
    work_ms: u64,
}

fn load_config(explicit: Option<&Path>) -> EngineConfig {
    if let Some(path) = explicit {
        return match EngineConfig::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "loaded configuration");
                config
            }
            Err(e) => {
                eprintln!("error loading {}: {e}", path.display());
                process::exit(1);
            }
        };
    }

    for path in ["fairway.toml", "/etc/fairway/fairway.toml"] {
        if Path::new(path).exists() {
            match EngineConfig::load(path) {
                Ok(config) => {
                    info!(path, "loaded configuration");
                    return config;
                }
                Err(e) => {
                    eprintln!("error loading {path}: {e}");
                    process::exit(1);
                }
            }
        }
    }

    info!("no config file found, using defaults");
    EngineConfig::default()
}

/// Decodes each entity change, logs it and simulates some work.
struct DemoHandler {
    codec: JsonCodec<EntityChange>,
    work: Duration,
    expected: usize,
    /// Every invocation, redeliveries included.
    invocations: AtomicUsize,
    progress: Mutex<Progress>,
    all_done: Notify,
}

/// Distinct messages handled. A redelivered message counts once.
#[derive(Default)]
struct Progress {
    seen: HashSet<u128>,
    per_session: BTreeMap<String, usize>,
}

impl DemoHandler {
    fn new(codec: JsonCodec<EntityChange>, work: Duration, expected: usize) -> Self {
        Self {
            codec,
            work,
            expected,
            invocations: AtomicUsize::new(0),
            progress: Mutex::new(Progress::default()),
            all_done: Notify::new(),
        }
    }

    /// Returns true when this message is the last distinct one expected.
    fn record(&self, message: &Message) -> bool {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let mut progress = self.progress.lock();
        if !progress.seen.insert(message.id.as_u128()) {
            return false;
        }
        *progress
            .per_session
            .entry(message.session_key.clone())
            .or_default() += 1;
        progress.seen.len() == self.expected
    }

    fn handled(&self) -> usize {
        self.progress.lock().seen.len()
    }
}

#[async_trait]
impl MessageHandler for DemoHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let change = self.codec.decode_message(message)?;
        info!("{} - {}", message.session_key, change.id());
        tokio::time::sleep(self.work).await;

        if self.record(message) {
            self.all_done.notify_one();
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Summary {
    handled: usize,
    invocations: usize,
    per_session: BTreeMap<String, usize>,
    abandoned: u64,
    dead_lettered: u64,
    sessions_lost: u64,
    max_active_observed: usize,
    leaked_slots: usize,
    elapsed_ms: u128,
}

fn send_session(
    source: &MemorySource,
    codec: &JsonCodec<EntityChange>,
    session_key: &str,
    count: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for id in 1..=count {
        let body = codec.encode(&EntityChange::Product { id })?;
        source.send(OutboundMessage::new(session_key, body, codec.content_type()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fairway_core::telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref());
    if let Some(budget) = cli.max_concurrent_sessions {
        config.dispatcher.max_concurrent_sessions = budget;
    }
    config.validate()?;

    let source = Arc::new(MemorySource::new(config.source.clone()));
    let codec = JsonCodec::<EntityChange>::new();

    // Heavy tenant first, so its backlog is ahead of everyone at the source
    send_session(&source, &codec, "A", cli.heavy).map_err(|e| e.to_string())?;
    let mut senders = Vec::with_capacity(cli.sessions.len());
    for key in cli.sessions.clone() {
        let source = Arc::clone(&source);
        let count = cli.light;
        senders.push(tokio::task::spawn_blocking(move || {
            send_session(&source, &JsonCodec::new(), &key, count)
        }));
    }
    for sender in senders {
        sender.await?.map_err(|e| e.to_string())?;
    }

    let expected = (cli.heavy + cli.light * cli.sessions.len() as u64) as usize;
    info!(
        expected,
        max_concurrent_sessions = config.dispatcher.max_concurrent_sessions,
        "messages published"
    );

    let handler = Arc::new(DemoHandler::new(
        codec,
        Duration::from_millis(cli.work_ms),
        expected,
    ));
    let started = Instant::now();
    let engine = Engine::start(config, source, handler.clone())?;

    tokio::select! {
        _ = handler.all_done.notified(), if expected > 0 => info!("all messages handled"),
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
        result = engine.wait() => {
            if let Err(e) = result {
                warn!(error = %e, "engine stopped early");
            }
        }
    }

    let report = engine.shutdown().await?;
    let summary = Summary {
        handled: handler.handled(),
        invocations: handler.invocations.load(Ordering::SeqCst),
        per_session: handler.progress.lock().per_session.clone(),
        abandoned: report.stats.totals.abandoned,
        dead_lettered: report.stats.totals.dead_lettered,
        sessions_lost: report.stats.totals.lost,
        max_active_observed: report.stats.max_active_observed,
        leaked_slots: report.leaked_slots,
        elapsed_ms: started.elapsed().as_millis(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
