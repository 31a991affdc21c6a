//! `ShardSource` — the read side of a shard-set monitor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use vqueue_core::{QueueError, QueueResult};

use crate::shard::{Shard, ShardSet};

/// Anything that can hand out the current shard snapshot of one virtual
/// queue.
#[async_trait]
pub trait ShardSource: Send + Sync {
    /// Name of the virtual queue the shards belong to.
    fn queue_name(&self) -> &str;

    /// Most recent snapshot. Never blocks on I/O.
    fn shards(&self) -> Arc<ShardSet>;

    /// Rebuild the snapshot now and return it.
    async fn refresh(&self) -> QueueResult<Arc<ShardSet>>;

    /// Highest-index shard that currently accepts sends.
    fn send_shard(&self) -> QueueResult<Shard> {
        self.shards()
            .send_shard()
            .cloned()
            .ok_or_else(|| QueueError::NoSendableShard(self.queue_name().to_string()))
    }

    /// Lowest-index shard that currently accepts receives.
    fn receive_shard(&self) -> QueueResult<Shard> {
        self.shards()
            .receive_shard()
            .cloned()
            .ok_or_else(|| QueueError::NoReceivableShard(self.queue_name().to_string()))
    }
}

/// A `ShardSource` over a snapshot set by hand, for tests and embedding.
pub struct StaticShardSource {
    queue_name: String,
    snapshot: Mutex<Arc<ShardSet>>,
    refreshes: AtomicU64,
}

impl StaticShardSource {
    pub fn new(queue_name: &str, shards: ShardSet) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            snapshot: Mutex::new(Arc::new(shards)),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Swap in a new snapshot.
    pub fn replace(&self, shards: ShardSet) {
        *self.snapshot.lock().expect("snapshot lock") = Arc::new(shards);
    }

    /// Number of `refresh()` calls so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ShardSource for StaticShardSource {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn shards(&self) -> Arc<ShardSet> {
        self.snapshot.lock().expect("snapshot lock").clone()
    }

    async fn refresh(&self) -> QueueResult<Arc<ShardSet>> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(self.shards())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vqueue_backend::{MemoryQueueService, QueueService};

    #[tokio::test]
    async fn empty_source_reports_missing_roles() {
        let source = StaticShardSource::new("q", ShardSet::default());
        assert!(matches!(
            source.send_shard(),
            Err(QueueError::NoSendableShard(name)) if name == "q"
        ));
        assert!(matches!(
            source.receive_shard(),
            Err(QueueError::NoReceivableShard(_))
        ));
    }

    #[tokio::test]
    async fn replace_swaps_snapshot() {
        let service = MemoryQueueService::new(1);
        let q0 = Shard::new(service.create_queue("q-0").await.unwrap()).unwrap();
        let source = StaticShardSource::new("q", ShardSet::default());

        let before = source.shards();
        source.replace(ShardSet::new(vec![q0]));
        assert!(before.is_empty());
        assert_eq!(source.send_shard().unwrap().index(), 0);

        source.refresh().await.unwrap();
        assert_eq!(source.refresh_count(), 1);
    }
}
