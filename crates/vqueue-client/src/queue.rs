//! `VirtualQueue` — one logical queue over a growing set of shards.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use vqueue_backend::QueueService;
use vqueue_core::{
    BackendError, Message, QueueResult, ReceivedMessage, SendReceipt, shard_name,
    validate_queue_name,
};
use vqueue_shard::{MonitorConfig, ShardSet, ShardSetMonitor, ShardSource};

use crate::codec::{decode_json, encode_json};
use crate::receiver::ReceiverHandle;

/// Client handle tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Refresh interval of a handle-owned monitor.
    pub poll_interval: Duration,
    /// Upper bound on `close()` waiting for the monitor loop.
    pub close_timeout: Duration,
    /// Long-poll wait used by receive pumps.
    pub receive_wait: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
            receive_wait: Duration::from_secs(1),
        }
    }
}

/// A virtual queue handle.
///
/// Every operation resolves its shard from the current snapshot and makes
/// one backend call; nothing is retried. When the backend reports that the
/// snapshot is stale (queue gone, or no longer sending/receiving) the
/// handle refreshes its shard view before returning the error, so the
/// caller's retry sees the new topology.
pub struct VirtualQueue {
    name: String,
    source: Arc<dyn ShardSource>,
    /// Set when the handle started its own monitor.
    monitor: Option<Arc<ShardSetMonitor>>,
    config: ClientConfig,
}

impl VirtualQueue {
    /// Create the virtual queue (shard 0, fully enabled) and open it.
    /// Creating an existing virtual queue opens it.
    pub async fn create(
        service: Arc<dyn QueueService>,
        name: &str,
        config: ClientConfig,
    ) -> QueueResult<Self> {
        Self::ensure_created(service.as_ref(), name).await?;
        Self::open(service, name, config).await
    }

    /// Create shard 0 fully enabled unless it already exists. Returns
    /// whether a shard was created.
    pub async fn ensure_created(service: &dyn QueueService, name: &str) -> QueueResult<bool> {
        validate_queue_name(name)?;
        let first = shard_name(name, 0);
        match service.create_queue(&first).await {
            Ok(_) => {
                info!(queue = %name, shard = %first, "virtual queue created");
                Ok(true)
            }
            Err(BackendError::AlreadyExists(_)) => {
                debug!(queue = %name, shard = %first, "virtual queue already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open an existing virtual queue with a monitor owned by this handle.
    pub async fn open(
        service: Arc<dyn QueueService>,
        name: &str,
        config: ClientConfig,
    ) -> QueueResult<Self> {
        validate_queue_name(name)?;
        let monitor = Arc::new(ShardSetMonitor::new(
            name,
            service,
            MonitorConfig {
                poll_interval: config.poll_interval,
            },
        ));
        monitor.start().await?;

        Ok(Self {
            name: name.to_string(),
            source: Arc::clone(&monitor) as Arc<dyn ShardSource>,
            monitor: Some(monitor),
            config,
        })
    }

    /// Use an existing shard view, typically a scaling agent's monitor.
    pub fn attach(source: Arc<dyn ShardSource>, config: ClientConfig) -> Self {
        Self {
            name: source.queue_name().to_string(),
            source,
            monitor: None,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<dyn ShardSource> {
        &self.source
    }

    /// Current shard snapshot.
    pub fn shards(&self) -> Arc<ShardSet> {
        self.source.shards()
    }

    // ── Sending ────────────────────────────────────────────────────

    pub async fn send(&self, message: impl Into<Message>) -> QueueResult<u64> {
        let shard = self.source.send_shard()?;
        let result = shard.send(message.into()).await;
        settle(self.source.as_ref(), result).await
    }

    /// Send a message that becomes visible to receivers at `at`.
    pub async fn send_scheduled(
        &self,
        message: impl Into<Message>,
        at: SystemTime,
    ) -> QueueResult<u64> {
        let shard = self.source.send_shard()?;
        let result = shard.send_scheduled(message.into(), at).await;
        settle(self.source.as_ref(), result).await
    }

    /// Send a batch to the current send shard in one backend call.
    pub async fn send_batch(&self, messages: Vec<Message>) -> QueueResult<SendReceipt> {
        let shard = self.source.send_shard()?;
        let result = shard.send_batch(messages).await;
        settle(self.source.as_ref(), result).await
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> QueueResult<u64> {
        self.send(encode_json(value)?).await
    }

    // ── Receiving ──────────────────────────────────────────────────

    /// Take the oldest visible message of the receive shard, if any.
    pub async fn receive(&self) -> QueueResult<Option<ReceivedMessage>> {
        let shard = self.source.receive_shard()?;
        let result = shard.receive().await;
        settle(self.source.as_ref(), result).await
    }

    /// Wait up to `max_wait` for messages on the receive shard.
    pub async fn receive_batch(&self, max_wait: Duration) -> QueueResult<Vec<ReceivedMessage>> {
        receive_batch_from(self.source.as_ref(), max_wait).await
    }

    pub async fn receive_json<T: DeserializeOwned>(&self) -> QueueResult<Option<T>> {
        match self.receive().await? {
            Some(message) => decode_json(&message).map(Some),
            None => Ok(None),
        }
    }

    /// Receive a batch and decode every message. One undecodable message
    /// fails the whole call; the batch is already consumed by then.
    pub async fn receive_batch_json<T: DeserializeOwned>(
        &self,
        max_wait: Duration,
    ) -> QueueResult<Vec<T>> {
        self.receive_batch(max_wait)
            .await?
            .iter()
            .map(decode_json)
            .collect()
    }

    /// Spawn a pump that hands every received message to `handler`.
    pub fn on_receive<F, Fut>(&self, handler: F) -> ReceiverHandle
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ReceiverHandle::spawn(Arc::clone(&self.source), self.config.receive_wait, handler)
    }

    /// Typed `on_receive`. Messages that fail to decode are logged and
    /// dropped.
    pub fn on_receive_json<T, F, Fut>(&self, handler: F) -> ReceiverHandle
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let queue = self.name.clone();
        self.on_receive(move |message| {
            let handler = Arc::clone(&handler);
            let queue = queue.clone();
            async move {
                match decode_json::<T>(&message) {
                    Ok(value) => handler(value).await,
                    Err(e) => warn!(
                        queue = %queue,
                        sequence = message.sequence,
                        error = %e,
                        "dropping undecodable message"
                    ),
                }
            }
        })
    }

    // ── Size ───────────────────────────────────────────────────────

    /// Capacity summed over all shards in the current snapshot.
    pub fn max_queue_size_megabytes(&self) -> u64 {
        self.source.shards().max_size_megabytes()
    }

    /// Stored bytes summed over all shards in the current snapshot.
    pub fn current_queue_size_bytes(&self) -> u64 {
        self.source.shards().current_size_bytes()
    }

    /// Stop the handle's own monitor, aborting it after `close_timeout`.
    /// Attached handles have nothing to stop.
    pub async fn close(&self) {
        if let Some(monitor) = &self.monitor {
            if !monitor.stop_within(self.config.close_timeout).await {
                warn!(queue = %self.name, "monitor aborted on close");
            }
        }
    }
}

pub(crate) async fn receive_batch_from(
    source: &dyn ShardSource,
    max_wait: Duration,
) -> QueueResult<Vec<ReceivedMessage>> {
    let shard = source.receive_shard()?;
    let result = shard.receive_batch(max_wait).await;
    settle(source, result).await
}

/// Refresh the shard view when a backend error says it is stale.
async fn settle<T>(source: &dyn ShardSource, result: QueueResult<T>) -> QueueResult<T> {
    if let Err(e) = &result
        && e.backend().is_some_and(BackendError::is_stale_topology)
    {
        debug!(queue = %source.queue_name(), error = %e, "stale shard view; refreshing");
        if let Err(refresh_err) = source.refresh().await {
            warn!(
                queue = %source.queue_name(),
                error = %refresh_err,
                "shard refresh failed"
            );
        }
    }
    result
}
