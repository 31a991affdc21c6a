//! Shards and shard-set snapshots.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use vqueue_backend::PhysicalQueue;
use vqueue_core::{
    BYTES_PER_MEGABYTE, Message, QueueError, QueueResult, ReceivedMessage, SendReceipt, ShardState,
    parse_shard_index,
};

/// One physical queue acting as a slice of a virtual queue.
#[derive(Clone)]
pub struct Shard {
    index: u64,
    queue: Arc<dyn PhysicalQueue>,
}

impl Shard {
    /// Wrap a physical queue, parsing its index from the trailing digits
    /// of its name.
    pub fn new(queue: Arc<dyn PhysicalQueue>) -> QueueResult<Self> {
        if queue.name().trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "physical queue name must not be empty".into(),
            ));
        }
        let index = parse_shard_index(queue.name())?;
        Ok(Self { index, queue })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue(&self) -> &Arc<dyn PhysicalQueue> {
        &self.queue
    }

    pub fn state(&self) -> ShardState {
        ShardState::from_flags(self.queue.is_send_enabled(), self.queue.is_receive_enabled())
    }

    pub fn can_send(&self) -> bool {
        self.queue.is_send_enabled()
    }

    pub fn can_receive(&self) -> bool {
        self.queue.is_receive_enabled()
    }

    pub fn max_size_megabytes(&self) -> u64 {
        self.queue.max_size_megabytes()
    }

    pub fn current_size_bytes(&self) -> u64 {
        self.queue.current_size_bytes()
    }

    /// Fraction of capacity in use: `current_bytes / (max_mb * 1 MiB)`.
    pub fn storage_utilization(&self) -> QueueResult<f64> {
        let max = self.queue.max_size_megabytes();
        if max == 0 {
            return Err(QueueError::Configuration(format!(
                "queue {} reports zero capacity",
                self.name()
            )));
        }
        Ok(self.queue.current_size_bytes() as f64 / (max as f64 * BYTES_PER_MEGABYTE as f64))
    }

    pub async fn send(&self, message: Message) -> QueueResult<u64> {
        Ok(self.queue.send(message).await?)
    }

    pub async fn send_scheduled(&self, message: Message, at: SystemTime) -> QueueResult<u64> {
        Ok(self.queue.send_scheduled(message, at).await?)
    }

    pub async fn send_batch(&self, messages: Vec<Message>) -> QueueResult<SendReceipt> {
        Ok(self.queue.send_batch(messages).await?)
    }

    pub async fn receive(&self) -> QueueResult<Option<ReceivedMessage>> {
        Ok(self.queue.receive().await?)
    }

    pub async fn receive_batch(&self, max_wait: Duration) -> QueueResult<Vec<ReceivedMessage>> {
        Ok(self.queue.receive_batch(max_wait).await?)
    }

    pub fn summary(&self) -> ShardSummary {
        ShardSummary {
            name: self.name().to_string(),
            index: self.index,
            state: self.state(),
            max_size_megabytes: self.max_size_megabytes(),
            current_size_bytes: self.current_size_bytes(),
            utilization: self.storage_utilization().ok(),
        }
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Serializable point-in-time view of a shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardSummary {
    pub name: String,
    pub index: u64,
    pub state: ShardState,
    pub max_size_megabytes: u64,
    pub current_size_bytes: u64,
    pub utilization: Option<f64>,
}

/// Immutable, index-ordered snapshot of a virtual queue's shards.
#[derive(Clone, Default, Debug)]
pub struct ShardSet {
    shards: Vec<Shard>,
}

impl ShardSet {
    /// Build a snapshot, sorting shards ascending by index.
    pub fn new(mut shards: Vec<Shard>) -> Self {
        shards.sort_by_key(Shard::index);
        Self { shards }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn as_slice(&self) -> &[Shard] {
        &self.shards
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Shard> {
        self.shards.iter()
    }

    pub fn lowest(&self) -> Option<&Shard> {
        self.shards.first()
    }

    pub fn highest(&self) -> Option<&Shard> {
        self.shards.last()
    }

    /// Highest-index shard that currently accepts sends.
    pub fn send_shard(&self) -> Option<&Shard> {
        self.shards.iter().rev().find(|s| s.can_send())
    }

    /// Lowest-index shard that currently accepts receives.
    pub fn receive_shard(&self) -> Option<&Shard> {
        self.shards.iter().find(|s| s.can_receive())
    }

    /// Sum of every shard's capacity.
    pub fn max_size_megabytes(&self) -> u64 {
        self.shards
            .iter()
            .map(Shard::max_size_megabytes)
            .fold(0, u64::saturating_add)
    }

    /// Sum of every shard's usage.
    pub fn current_size_bytes(&self) -> u64 {
        self.shards
            .iter()
            .map(Shard::current_size_bytes)
            .fold(0, u64::saturating_add)
    }

    pub fn summaries(&self) -> Vec<ShardSummary> {
        self.shards.iter().map(Shard::summary).collect()
    }
}

impl<'a> IntoIterator for &'a ShardSet {
    type Item = &'a Shard;
    type IntoIter = std::slice::Iter<'a, Shard>;

    fn into_iter(self) -> Self::IntoIter {
        self.shards.iter()
    }
}
