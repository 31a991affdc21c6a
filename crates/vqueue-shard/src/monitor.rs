//! Shard-set monitor — background task that tracks a virtual queue's shards.
//!
//! The `ShardSetMonitor` lists every physical queue named `{queue}-{n}`,
//! rebuilds an index-ordered `ShardSet`, and publishes it through a watch
//! channel. Readers clone the current `Arc<ShardSet>`; a poll swaps in a
//! whole new snapshot and never edits the old one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vqueue_backend::QueueService;
use vqueue_core::{QueueResult, shard_prefix};

use crate::shard::{Shard, ShardSet};
use crate::source::ShardSource;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between background polls.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// State shared between the monitor and its poll loop.
struct Poller {
    queue_name: String,
    prefix: String,
    service: Arc<dyn QueueService>,
    snapshot: watch::Sender<Arc<ShardSet>>,
    /// Held from listing to publishing, so snapshots are published in the
    /// order they were listed.
    polling: Mutex<()>,
    /// Poll attempts, successful or not.
    polls: AtomicU64,
}

impl Poller {
    async fn poll(&self) -> QueueResult<Arc<ShardSet>> {
        let _polling = self.polling.lock().await;
        self.polls.fetch_add(1, Ordering::Relaxed);
        let queues = self.service.list_queues(&self.prefix).await?;

        let mut shards = Vec::with_capacity(queues.len());
        for queue in queues {
            if !belongs_to(&self.prefix, queue.name()) {
                continue;
            }
            shards.push(Shard::new(queue)?);
        }

        let set = Arc::new(ShardSet::new(shards));
        self.snapshot.send_replace(Arc::clone(&set));
        debug!(queue = %self.queue_name, shards = set.len(), "shard set refreshed");
        Ok(set)
    }
}

/// Whether `name` is a shard of the queue owning `prefix`. A suffix that
/// still contains `-` belongs to a longer queue name such as `{queue}-eu`.
fn belongs_to(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| !rest.contains('-'))
}

/// Handle to the running poll loop.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Keeps an eventually-consistent view of one virtual queue's shards.
pub struct ShardSetMonitor {
    poller: Arc<Poller>,
    config: MonitorConfig,
    slot: Mutex<Option<LoopSlot>>,
}

impl ShardSetMonitor {
    /// Create a stopped monitor with an empty snapshot.
    pub fn new(queue_name: &str, service: Arc<dyn QueueService>, config: MonitorConfig) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ShardSet::default()));
        Self {
            poller: Arc::new(Poller {
                queue_name: queue_name.to_string(),
                prefix: shard_prefix(queue_name),
                service,
                snapshot,
                polling: Mutex::new(()),
                polls: AtomicU64::new(0),
            }),
            config,
            slot: Mutex::new(None),
        }
    }

    /// Poll once, then start the background loop.
    ///
    /// Returns the first poll's error without starting the loop, so a
    /// caller learns immediately when the backend is unreachable. Starting
    /// a running monitor is a no-op.
    pub async fn start(&self) -> QueueResult<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            debug!(queue = %self.poller.queue_name, "shard monitor already running");
            return Ok(());
        }

        let initial = self.poller.poll().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Arc::clone(&self.poller);
        let interval = self.config.poll_interval;
        let handle = tokio::spawn(async move {
            run_poll_loop(poller, interval, shutdown_rx).await;
        });
        *slot = Some(LoopSlot {
            handle,
            shutdown_tx,
        });

        info!(
            queue = %self.poller.queue_name,
            shards = initial.len(),
            interval_ms = interval.as_millis() as u64,
            "shard monitor started"
        );
        Ok(())
    }

    /// Stop the loop and wait for it to exit. An in-flight poll finishes
    /// first; no poll starts after this returns.
    pub async fn stop(&self) {
        let slot = self.slot.lock().await.take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            info!(queue = %self.poller.queue_name, "shard monitor stopped");
        }
    }

    /// Like `stop`, but abort the loop if it has not exited within
    /// `timeout`. Returns whether the loop exited on its own.
    pub async fn stop_within(&self, timeout: Duration) -> bool {
        let Some(slot) = self.slot.lock().await.take() else {
            return true;
        };
        let _ = slot.shutdown_tx.send(true);
        let mut handle = slot.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                info!(queue = %self.poller.queue_name, "shard monitor stopped");
                true
            }
            Err(_) => {
                handle.abort();
                warn!(
                    queue = %self.poller.queue_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "shard monitor did not stop in time; aborted"
                );
                false
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ShardSet>> {
        self.poller.snapshot.subscribe()
    }

    /// Poll attempts made so far, including failed ones.
    pub fn poll_count(&self) -> u64 {
        self.poller.polls.load(Ordering::Relaxed)
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

#[async_trait]
impl ShardSource for ShardSetMonitor {
    fn queue_name(&self) -> &str {
        &self.poller.queue_name
    }

    fn shards(&self) -> Arc<ShardSet> {
        self.poller.snapshot.borrow().clone()
    }

    async fn refresh(&self) -> QueueResult<Arc<ShardSet>> {
        self.poller.poll().await
    }
}

impl Drop for ShardSetMonitor {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get_mut().take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
    }
}

/// The poll loop for a single virtual queue.
async fn run_poll_loop(
    poller: Arc<Poller>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(queue = %poller.queue_name, "shard poll loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = poller.poll().await {
            warn!(
                queue = %poller.queue_name,
                error = %e,
                "shard poll failed; keeping previous snapshot"
            );
        }
    }

    debug!(queue = %poller.queue_name, "shard poll loop shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use vqueue_backend::testing::{Operation, RecordingService};
    use vqueue_backend::{MemoryQueueService, QueueService};
    use vqueue_core::QueueError;

    const INTERVAL: Duration = Duration::from_secs(1);

    fn setup() -> (MemoryQueueService, RecordingService) {
        let memory = MemoryQueueService::new(1);
        let recording = RecordingService::new(Arc::new(memory.clone()));
        (memory, recording)
    }

    fn monitor(service: &RecordingService) -> ShardSetMonitor {
        ShardSetMonitor::new(
            "q",
            Arc::new(service.clone()),
            MonitorConfig {
                poll_interval: INTERVAL,
            },
        )
    }

    #[test]
    fn belongs_to_filters_nested_queues() {
        assert!(belongs_to("q-", "q-0"));
        assert!(belongs_to("q-", "q-12"));
        assert!(belongs_to("q-", "q-dlq"));
        assert!(!belongs_to("q-", "q-eu-0"));
        assert!(!belongs_to("q-", "other-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn start_populates_snapshot_before_returning() {
        let (memory, recording) = setup();
        memory.create_queue("q-1").await.unwrap();
        memory.create_queue("q-0").await.unwrap();
        memory.create_queue("q-eu-0").await.unwrap();

        let monitor = monitor(&recording);
        assert!(monitor.shards().is_empty());
        monitor.start().await.unwrap();

        let indexes: Vec<u64> = monitor.shards().iter().map(Shard::index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert_eq!(monitor.send_shard().unwrap().index(), 1);
        assert_eq!(monitor.receive_shard().unwrap().index(), 0);
        assert!(monitor.is_running().await);

        monitor.stop().await;
        assert!(!monitor.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn start_fails_fast_when_backend_unreachable() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        recording.fail_next(Operation::ListQueues, 1);

        let monitor = monitor(&recording);
        let err = monitor.start().await.unwrap_err();
        assert!(matches!(err, QueueError::BackendUnavailable(_)));
        assert!(!monitor.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn start_surfaces_malformed_names() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        memory.create_queue("q-dlq").await.unwrap();

        let monitor = monitor(&recording);
        assert!(matches!(
            monitor.start().await,
            Err(QueueError::MalformedName(name)) if name == "q-dlq"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_picks_up_new_shards() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        let monitor = monitor(&recording);
        monitor.start().await.unwrap();
        let mut changes = monitor.subscribe();
        changes.mark_unchanged();

        memory.create_send_only_queue("q-1").await.unwrap();
        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;

        assert!(changes.has_changed().unwrap());
        assert_eq!(monitor.shards().len(), 2);
        assert_eq!(monitor.send_shard().unwrap().index(), 1);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_previous_snapshot() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        let monitor = monitor(&recording);
        monitor.start().await.unwrap();
        let before = monitor.shards();

        memory.create_queue("q-1").await.unwrap();
        recording.fail_next(Operation::ListQueues, 1);
        tokio::time::sleep(INTERVAL + INTERVAL / 2).await;

        assert_eq!(monitor.poll_count(), 2);
        assert!(Arc::ptr_eq(&before, &monitor.shards()));

        // The loop survives the failure and recovers on the next tick.
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(monitor.shards().len(), 2);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_polls_after_stop() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        let monitor = monitor(&recording);
        monitor.start().await.unwrap();
        tokio::time::sleep(INTERVAL * 3 + INTERVAL / 2).await;

        monitor.stop().await;
        let polls = recording.count(Operation::ListQueues);
        assert!(polls >= 4);

        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(recording.count(Operation::ListQueues), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_within_and_restart() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        let monitor = monitor(&recording);

        monitor.start().await.unwrap();
        // A second start is a no-op.
        monitor.start().await.unwrap();
        assert!(monitor.stop_within(Duration::from_secs(5)).await);
        // Stopping an idle monitor is fine too.
        assert!(monitor.stop_within(Duration::from_secs(5)).await);

        monitor.start().await.unwrap();
        assert!(monitor.is_running().await);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_loop_poll_cannot_overwrite_newer_refresh() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        let monitor = Arc::new(monitor(&recording));
        monitor.start().await.unwrap();

        // The loop's next poll lists [q-0] and is parked before publishing.
        let mut held = recording.hold_next(Operation::ListQueues);
        held.reached().await;

        memory.create_send_only_queue("q-1").await.unwrap();
        let refresh = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.refresh().await.map(|set| set.len()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The refresh waits for the parked poll instead of racing it.
        assert!(!refresh.is_finished());

        held.release();
        assert_eq!(refresh.await.unwrap().unwrap(), 2);
        assert_eq!(monitor.shards().len(), 2);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_replaces_snapshot_immediately() {
        let (memory, recording) = setup();
        memory.create_queue("q-0").await.unwrap();
        let monitor = monitor(&recording);
        monitor.start().await.unwrap();
        let old = monitor.shards();

        memory.create_send_only_queue("q-1").await.unwrap();
        let fresh = monitor.refresh().await.unwrap();

        assert_eq!(old.len(), 1);
        assert_eq!(fresh.len(), 2);
        assert!(Arc::ptr_eq(&fresh, &monitor.shards()));
        monitor.stop().await;
    }
}
