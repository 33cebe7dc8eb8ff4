mod command;
pub mod config;
mod dispatcher;
pub mod handler;
mod ingest;
pub mod metrics;
pub mod policy;
mod queue;
mod registry;
pub mod ring;
pub mod stats;
mod tracker;
mod worker;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::source::MessageSource;

pub use config::{DispatcherConfig, EngineConfig, IngestConfig, RotationPolicy, WorkerConfig};
pub use handler::MessageHandler;
pub use policy::{DeadLetterPolicy, FailureAction, MaxAttempts};
pub use stats::{DispatcherStats, ShutdownReport};
pub use tracker::TrackerTotals;

use command::ControlCommand;
use dispatcher::{Dispatcher, DispatcherExit};
use metrics::Metrics;
use worker::WorkerContext;

#[derive(Debug, Clone)]
enum EngineState {
    Running,
    Stopped(ShutdownReport),
    Faulted(String),
    Panicked,
}

/// A running dispatch engine.
///
/// The dispatcher runs on a dedicated OS thread and owns all scheduling
/// state. Ingestion runs on a second OS thread. Handlers and lock I/O run as
/// tasks on the tokio runtime that called [`Engine::start`]. Every method
/// takes `&self`, so shutdown may be requested from several places at once.
pub struct Engine {
    control: crossbeam_channel::Sender<ControlCommand>,
    state: watch::Receiver<EngineState>,
}

impl Engine {
    /// Start with the default dead-letter policy: give up after
    /// `worker.max_delivery_attempts` deliveries.
    pub fn start(
        config: EngineConfig,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
    ) -> EngineResult<Self> {
        let policy = Arc::new(MaxAttempts(config.worker.max_delivery_attempts));
        Self::start_with_policy(config, source, handler, policy)
    }

    /// Must be called from within a tokio runtime.
    #[tracing::instrument(skip_all, fields(
        max_concurrent_sessions = config.dispatcher.max_concurrent_sessions,
        rotation = ?config.dispatcher.rotation,
    ))]
    pub fn start_with_policy(
        config: EngineConfig,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
        policy: Arc<dyn DeadLetterPolicy>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::NoRuntime(e.to_string()))?;

        let (delivery_tx, delivery_rx) = crossbeam_channel::bounded(config.ingest.channel_capacity);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let context = Arc::new(WorkerContext {
            source: Arc::clone(&source),
            handler,
            policy,
            control: control_tx.clone(),
            handler_timeout: Duration::from_millis(config.worker.handler_timeout_ms),
            shutdown: cancel.clone(),
        });
        let runner = runtime.spawn(context.run(jobs_rx));

        let dispatcher = Dispatcher::new(&config.dispatcher, jobs_tx, cancel.clone(), Metrics::new());
        let (exit_tx, exit_rx) = oneshot::channel();
        let dispatcher_thread = thread::Builder::new()
            .name("fairway-dispatcher".to_string())
            .spawn(move || {
                let exit = dispatcher.run(delivery_rx, control_rx);
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn dispatcher thread");
                EngineError::SpawnFailed("dispatcher".to_string())
            })?;

        let ingest_source = Arc::clone(&source);
        let ingest_control = control_tx.clone();
        let ingest_cancel = cancel.clone();
        let ingest_config = config.ingest.clone();
        let spawned = thread::Builder::new()
            .name("fairway-ingest".to_string())
            .spawn(move || {
                ingest::run(
                    ingest_source,
                    delivery_tx,
                    ingest_control,
                    ingest_cancel,
                    &ingest_config,
                )
            });
        let ingest_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to spawn ingest thread");
                let _ = control_tx.send(ControlCommand::Shutdown);
                let _ = dispatcher_thread.join();
                return Err(EngineError::SpawnFailed("ingest".to_string()));
            }
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Running);
        runtime.spawn(supervise(Supervised {
            exit: exit_rx,
            runner,
            dispatcher_thread,
            ingest_thread,
            source,
            state: state_tx,
        }));

        info!("engine started");
        Ok(Self {
            control: control_tx,
            state: state_rx,
        })
    }

    /// Stop admitting sessions, let in-flight handlers finish, release every
    /// session lock and close the source. Safe to call more than once and
    /// from several tasks; every caller gets the same outcome.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(&self) -> EngineResult<ShutdownReport> {
        if self.is_running() {
            info!("engine shutdown requested");
        }
        // A stopped dispatcher has dropped its receiver; nothing to do then
        let _ = self.control.send(ControlCommand::Shutdown);
        self.wait().await
    }

    /// Resolve once the engine has stopped, whether by [`Engine::shutdown`]
    /// or on its own after a transport fault.
    pub async fn wait(&self) -> EngineResult<ShutdownReport> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, EngineState::Running))
            .await
            .map_err(|_| EngineError::DispatcherPanicked)?;
        match &*settled {
            EngineState::Stopped(report) => Ok(report.clone()),
            EngineState::Faulted(reason) => Err(EngineError::Transport(reason.clone())),
            EngineState::Running | EngineState::Panicked => Err(EngineError::DispatcherPanicked),
        }
    }

    /// Snapshot of the dispatcher. Fails once the engine has stopped.
    pub async fn stats(&self) -> EngineResult<DispatcherStats> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlCommand::GetStats { reply })
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), EngineState::Running)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Cleanup continues on the supervisor task
        if self.is_running() {
            let _ = self.control.send(ControlCommand::Shutdown);
        }
    }
}

struct Supervised {
    exit: oneshot::Receiver<DispatcherExit>,
    runner: JoinHandle<()>,
    dispatcher_thread: thread::JoinHandle<()>,
    ingest_thread: thread::JoinHandle<()>,
    source: Arc<dyn MessageSource>,
    state: watch::Sender<EngineState>,
}

/// Waits for the dispatcher to exit, then tears down the rest in order:
/// job runner, session locks, source, threads.
async fn supervise(supervised: Supervised) {
    let Supervised {
        exit,
        runner,
        dispatcher_thread,
        ingest_thread,
        source,
        state,
    } = supervised;

    // The sender only goes away without a value if the dispatcher panicked
    let exit = exit.await.ok();
    if let Err(e) = runner.await {
        error!(error = %e, "job runner failed");
    }

    let teardown = tokio::task::spawn_blocking(move || {
        let mut locks_released = 0;
        if let Some(exit) = &exit {
            for lock in &exit.locks {
                let token = lock.token();
                match lock.release() {
                    Ok(()) => locks_released += 1,
                    Err(e) => warn!(lock = %token, error = %e, "failed to release session lock"),
                }
            }
        }
        if let Err(e) = source.close() {
            warn!(error = %e, "failed to close message source");
        }
        if ingest_thread.join().is_err() {
            error!("ingest thread panicked");
        }
        if dispatcher_thread.join().is_err() {
            error!("dispatcher thread panicked");
        }
        (exit, locks_released)
    })
    .await;

    let next = match teardown {
        Ok((Some(exit), locks_released)) => {
            let report = ShutdownReport {
                leaked_slots: exit.leaked_slots,
                locks_released,
                stats: exit.stats,
            };
            info!(
                leaked_slots = report.leaked_slots,
                locks_released = report.locks_released,
                completed = report.stats.totals.completed,
                "engine stopped"
            );
            match exit.fault {
                Some(fault) => {
                    error!(error = %fault, "engine stopped on transport fault");
                    EngineState::Faulted(fault.to_string())
                }
                None => EngineState::Stopped(report),
            }
        }
        Ok((None, _)) => EngineState::Panicked,
        Err(e) => {
            error!(error = %e, "engine teardown failed");
            EngineState::Panicked
        }
    };
    let _ = state.send(next);
}
