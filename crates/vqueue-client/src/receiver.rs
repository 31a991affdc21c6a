//! Receive pump behind `VirtualQueue::on_receive`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vqueue_core::ReceivedMessage;
use vqueue_shard::ShardSource;

use crate::queue::receive_batch_from;

/// A running receive pump.
///
/// Dropping the handle also stops the pump, without waiting for it.
pub struct ReceiverHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    delivered: Arc<AtomicU64>,
}

impl ReceiverHandle {
    pub(crate) fn spawn<F, Fut>(source: Arc<dyn ShardSource>, wait: Duration, handler: F) -> Self
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&delivered);
        let handle = tokio::spawn(async move {
            run_pump(source, wait, handler, counter, shutdown_rx).await;
        });
        Self {
            handle,
            shutdown_tx,
            delivered,
        }
    }

    /// Messages handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Stop the pump and wait for it. A handler call in progress finishes
    /// first; messages already received in the current batch are still
    /// delivered.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn run_pump<F, Fut>(
    source: Arc<dyn ShardSource>,
    wait: Duration,
    handler: F,
    delivered: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let queue = source.queue_name().to_string();
    debug!(queue = %queue, "receive pump starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = tokio::select! {
            batch = receive_batch_from(source.as_ref(), wait) => batch,
            _ = shutdown.changed() => break,
        };

        match batch {
            Ok(messages) => {
                for message in messages {
                    handler(message).await;
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "receive failed; retrying");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    debug!(queue = %queue, "receive pump shutting down");
}
