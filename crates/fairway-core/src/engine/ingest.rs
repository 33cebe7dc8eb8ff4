use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::command::ControlCommand;
use crate::engine::config::IngestConfig;
use crate::error::SourceError;
use crate::message::Delivery;
use crate::source::MessageSource;

/// Pull deliveries from the source and forward them to the dispatcher until
/// cancelled, the source closes, or the dispatcher goes away. Blocks the
/// calling thread.
///
/// A transport error is fatal: it is reported on the control channel so the
/// dispatcher can shut the engine down, and the loop exits.
pub(crate) fn run(
    source: Arc<dyn MessageSource>,
    deliveries: Sender<Delivery>,
    control: Sender<ControlCommand>,
    cancel: CancellationToken,
    config: &IngestConfig,
) {
    let wait = Duration::from_millis(config.receive_wait_ms);
    info!(max_batch = config.max_batch, "ingestion started");

    'outer: while !cancel.is_cancelled() {
        match source.receive(config.max_batch, wait) {
            Ok(batch) => {
                if !batch.is_empty() {
                    debug!(count = batch.len(), "received batch");
                }
                for delivery in batch {
                    if deliveries.send(delivery).is_err() {
                        debug!("dispatcher gone, stopping ingestion");
                        break 'outer;
                    }
                }
            }
            Err(SourceError::Closed) => {
                info!("message source closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "receive failed, stopping ingestion");
                let _ = control.send(ControlCommand::TransportFault(e));
                break;
            }
        }
    }

    info!("ingestion stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundMessage;
    use crate::source::MemorySource;

    fn config() -> IngestConfig {
        IngestConfig {
            max_batch: 8,
            receive_wait_ms: 10,
            channel_capacity: 64,
        }
    }

    fn spawn(
        source: &MemorySource,
        cancel: &CancellationToken,
    ) -> (
        crossbeam_channel::Receiver<Delivery>,
        crossbeam_channel::Receiver<ControlCommand>,
        std::thread::JoinHandle<()>,
    ) {
        let (dtx, drx) = crossbeam_channel::bounded(64);
        let (ctx, crx) = crossbeam_channel::unbounded();
        let source: Arc<dyn MessageSource> = Arc::new(source.clone());
        let cancel = cancel.clone();
        let handle = std::thread::spawn(move || run(source, dtx, ctx, cancel, &config()));
        (drx, crx, handle)
    }

    #[test]
    fn forwards_deliveries_in_arrival_order() {
        let source = MemorySource::default();
        for i in 0..5 {
            source
                .send(OutboundMessage::new("A", vec![i], "text/plain"))
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let (deliveries, _control, handle) = spawn(&source, &cancel);

        let seqs: Vec<u64> = (0..5)
            .map(|_| {
                deliveries
                    .recv_timeout(Duration::from_secs(2))
                    .unwrap()
                    .message
                    .sequence_id
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn transport_fault_is_reported_and_stops_loop() {
        let source = MemorySource::default();
        source.inject_fault("connection reset");
        let cancel = CancellationToken::new();
        let (_deliveries, control, handle) = spawn(&source, &cancel);

        match control.recv_timeout(Duration::from_secs(2)) {
            Ok(ControlCommand::TransportFault(SourceError::Transport(reason))) => {
                assert_eq!(reason, "connection reset");
            }
            _ => panic!("expected a transport fault"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn closed_source_stops_quietly() {
        let source = MemorySource::default();
        let cancel = CancellationToken::new();
        let (_deliveries, control, handle) = spawn(&source, &cancel);

        source.close().unwrap();
        handle.join().unwrap();
        assert!(control.try_recv().is_err());
    }
}
