//! redb-backed physical queue backend.
//!
//! Queue metadata lives in the `queues` table keyed by queue name. Messages
//! live in the `messages` table keyed by `{queue}\0{sequence:020}`, so a
//! range scan over one queue's key space yields its messages in FIFO order.
//!
//! Handles returned by the service cache the queue record they were built
//! from; their size and flag accessors reflect that record, refreshed by
//! every send/receive made through the handle. The send/receive paths
//! always check the committed flags.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vqueue_core::{
    BackendError, BackendResult, Message, ReceivedMessage, SendReceipt, capacity_bytes,
};

use crate::capability::{PhysicalQueue, QueueService, epoch_millis, now_millis};
use crate::memory::DEFAULT_BATCH_LIMIT;

/// Queue records keyed by queue name.
const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");

/// Messages keyed by `{queue}\0{sequence:020}`.
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// How often `receive_batch` re-checks an empty queue.
const RECEIVE_POLL: Duration = Duration::from_millis(50);

/// Convert any `Display` error into a `BackendError::Storage`.
macro_rules! map_err {
    () => {
        |e| BackendError::Storage(e.to_string())
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct QueueRecord {
    name: String,
    max_size_megabytes: u64,
    send_enabled: bool,
    receive_enabled: bool,
    size_bytes: u64,
    next_sequence: u64,
    created_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    sequence: u64,
    body: Vec<u8>,
    content_type: Option<String>,
    enqueued_at: u64,
    visible_at: u64,
}

fn message_key(queue: &str, sequence: u64) -> String {
    format!("{queue}\u{0}{sequence:020}")
}

/// Key range covering every message of `queue`.
fn message_range(queue: &str) -> (String, String) {
    (format!("{queue}\u{0}"), format!("{queue}\u{1}"))
}

fn read_record(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
) -> BackendResult<Option<QueueRecord>> {
    match table.get(name).map_err(map_err!())? {
        Some(guard) => serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(map_err!()),
        None => Ok(None),
    }
}

/// Queue service persisted in a redb database.
#[derive(Clone)]
pub struct RedbQueueService {
    db: Arc<Database>,
    max_size_megabytes: u64,
    batch_limit: usize,
}

impl RedbQueueService {
    /// Open (or create) a persistent queue database at the given path.
    ///
    /// A file already opened by another `Database` (in this or another
    /// process) is reported as `Unavailable`.
    pub fn open(path: &Path, max_size_megabytes: u64) -> BackendResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                BackendError::Unavailable(format!("{} is already open", path.display()))
            }
            other => BackendError::Storage(other.to_string()),
        })?;
        let service = Self::from_database(db, max_size_megabytes)?;
        debug!(?path, "queue database opened");
        Ok(service)
    }

    /// Create an ephemeral in-memory queue database (for testing).
    pub fn open_in_memory(max_size_megabytes: u64) -> BackendResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!())?;
        Self::from_database(db, max_size_megabytes)
    }

    fn from_database(db: Database, max_size_megabytes: u64) -> BackendResult<Self> {
        let service = Self {
            db: Arc::new(db),
            max_size_megabytes,
            batch_limit: DEFAULT_BATCH_LIMIT,
        };
        service.ensure_tables()?;
        Ok(service)
    }

    /// Override the maximum number of messages per `receive_batch`.
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    fn ensure_tables(&self) -> BackendResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        txn.open_table(QUEUES).map_err(map_err!())?;
        txn.open_table(MESSAGES).map_err(map_err!())?;
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    fn handle(&self, record: QueueRecord) -> Arc<dyn PhysicalQueue> {
        Arc::new(RedbQueue {
            service: self.clone(),
            name: record.name.clone(),
            cached: RwLock::new(record),
        })
    }

    fn create(&self, name: &str, send: bool, receive: bool) -> BackendResult<QueueRecord> {
        let record = QueueRecord {
            name: name.to_string(),
            max_size_megabytes: self.max_size_megabytes,
            send_enabled: send,
            receive_enabled: receive,
            size_bytes: 0,
            next_sequence: 0,
            created_at: now_millis(),
        };
        let value = serde_json::to_vec(&record).map_err(map_err!())?;

        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(QUEUES).map_err(map_err!())?;
            if table.get(name).map_err(map_err!())?.is_some() {
                return Err(BackendError::AlreadyExists(name.to_string()));
            }
            table
                .insert(name, value.as_slice())
                .map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        debug!(queue = %name, send, receive, "redb queue created");
        Ok(record)
    }

    fn list_records(&self, prefix: &str) -> BackendResult<Vec<QueueRecord>> {
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(QUEUES).map_err(map_err!())?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!())? {
            let (key, value) = entry.map_err(map_err!())?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let record: QueueRecord = serde_json::from_slice(value.value()).map_err(map_err!())?;
            results.push(record);
        }
        Ok(results)
    }

    fn set_flags(&self, name: &str, send: bool, receive: bool) -> BackendResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(QUEUES).map_err(map_err!())?;
            let mut record = read_record(&table, name)?
                .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
            record.send_enabled = send;
            record.receive_enabled = receive;
            let value = serde_json::to_vec(&record).map_err(map_err!())?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        debug!(queue = %name, send, receive, "redb queue flags updated");
        Ok(())
    }

    fn enqueue(
        &self,
        name: &str,
        messages: Vec<Message>,
        visible_at: u64,
    ) -> BackendResult<(SendReceipt, QueueRecord)> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        let (receipt, record) = {
            let mut queues = txn.open_table(QUEUES).map_err(map_err!())?;
            let mut record = read_record(&queues, name)?
                .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
            if !record.send_enabled {
                return Err(BackendError::SendDisabled(name.to_string()));
            }

            let incoming: u64 = messages.iter().map(Message::size_bytes).sum();
            if record.size_bytes.saturating_add(incoming) > capacity_bytes(record.max_size_megabytes) {
                return Err(BackendError::QuotaExceeded {
                    name: name.to_string(),
                    max_size_megabytes: record.max_size_megabytes,
                });
            }

            let first_sequence = record.next_sequence;
            let accepted = messages.len();
            let enqueued_at = now_millis();
            let mut table = txn.open_table(MESSAGES).map_err(map_err!())?;
            for message in messages {
                let stored = StoredMessage {
                    sequence: record.next_sequence,
                    body: message.body.to_vec(),
                    content_type: message.content_type,
                    enqueued_at,
                    visible_at,
                };
                let key = message_key(name, stored.sequence);
                let value = serde_json::to_vec(&stored).map_err(map_err!())?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!())?;
                record.next_sequence += 1;
            }

            record.size_bytes += incoming;
            let value = serde_json::to_vec(&record).map_err(map_err!())?;
            queues
                .insert(name, value.as_slice())
                .map_err(map_err!())?;
            (
                SendReceipt {
                    accepted,
                    first_sequence,
                },
                record,
            )
        };
        txn.commit().map_err(map_err!())?;
        Ok((receipt, record))
    }

    fn take(&self, name: &str, limit: usize) -> BackendResult<(Vec<ReceivedMessage>, QueueRecord)> {
        let now = now_millis();
        let txn = self.db.begin_write().map_err(map_err!())?;
        let (received, record) = {
            let mut queues = txn.open_table(QUEUES).map_err(map_err!())?;
            let mut record = read_record(&queues, name)?
                .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
            if !record.receive_enabled {
                return Err(BackendError::ReceiveDisabled(name.to_string()));
            }

            let mut table = txn.open_table(MESSAGES).map_err(map_err!())?;
            let (start, end) = message_range(name);
            let mut picked: Vec<(String, StoredMessage)> = Vec::new();
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!())?
            {
                if picked.len() >= limit {
                    break;
                }
                let (key, value) = entry.map_err(map_err!())?;
                let stored: StoredMessage =
                    serde_json::from_slice(value.value()).map_err(map_err!())?;
                if stored.visible_at <= now {
                    picked.push((key.value().to_string(), stored));
                }
            }

            for (key, _) in &picked {
                table.remove(key.as_str()).map_err(map_err!())?;
            }
            let released: u64 = picked.iter().map(|(_, m)| m.body.len() as u64).sum();
            record.size_bytes = record.size_bytes.saturating_sub(released);
            if !picked.is_empty() {
                let value = serde_json::to_vec(&record).map_err(map_err!())?;
                queues
                    .insert(name, value.as_slice())
                    .map_err(map_err!())?;
            }

            let received = picked
                .into_iter()
                .map(|(_, m)| ReceivedMessage {
                    sequence: m.sequence,
                    body: Bytes::from(m.body),
                    content_type: m.content_type,
                    enqueued_at: m.enqueued_at,
                })
                .collect();
            (received, record)
        };
        txn.commit().map_err(map_err!())?;
        Ok((received, record))
    }
}

#[async_trait]
impl QueueService for RedbQueueService {
    async fn create_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>> {
        self.create(name, true, true).map(|r| self.handle(r))
    }

    async fn create_send_only_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>> {
        self.create(name, true, false).map(|r| self.handle(r))
    }

    async fn list_queues(&self, prefix: &str) -> BackendResult<Vec<Arc<dyn PhysicalQueue>>> {
        Ok(self
            .list_records(prefix)?
            .into_iter()
            .map(|r| self.handle(r))
            .collect())
    }

    async fn set_queue_enabled(&self, name: &str) -> BackendResult<()> {
        self.set_flags(name, true, true)
    }

    async fn set_queue_receive_only(&self, name: &str) -> BackendResult<()> {
        self.set_flags(name, false, true)
    }

    async fn set_queue_disabled(&self, name: &str) -> BackendResult<()> {
        self.set_flags(name, false, false)
    }
}

/// Handle to one queue stored in redb.
struct RedbQueue {
    service: RedbQueueService,
    name: String,
    cached: RwLock<QueueRecord>,
}

impl RedbQueue {
    fn remember(&self, record: QueueRecord) {
        *self.cached.write().expect("record lock") = record;
    }

    fn cached<T>(&self, f: impl FnOnce(&QueueRecord) -> T) -> T {
        f(&self.cached.read().expect("record lock"))
    }

    fn enqueue(&self, messages: Vec<Message>, visible_at: u64) -> BackendResult<SendReceipt> {
        let (receipt, record) = self.service.enqueue(&self.name, messages, visible_at)?;
        self.remember(record);
        Ok(receipt)
    }

    fn take(&self, limit: usize) -> BackendResult<Vec<ReceivedMessage>> {
        let (received, record) = self.service.take(&self.name, limit)?;
        self.remember(record);
        Ok(received)
    }
}

#[async_trait]
impl PhysicalQueue for RedbQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_size_megabytes(&self) -> u64 {
        self.cached(|r| r.max_size_megabytes)
    }

    fn current_size_bytes(&self) -> u64 {
        self.cached(|r| r.size_bytes)
    }

    fn is_send_enabled(&self) -> bool {
        self.cached(|r| r.send_enabled)
    }

    fn is_receive_enabled(&self) -> bool {
        self.cached(|r| r.receive_enabled)
    }

    async fn send(&self, message: Message) -> BackendResult<u64> {
        self.enqueue(vec![message], 0).map(|r| r.first_sequence)
    }

    async fn send_scheduled(&self, message: Message, at: SystemTime) -> BackendResult<u64> {
        self.enqueue(vec![message], epoch_millis(at))
            .map(|r| r.first_sequence)
    }

    async fn send_batch(&self, messages: Vec<Message>) -> BackendResult<SendReceipt> {
        self.enqueue(messages, 0)
    }

    async fn receive(&self) -> BackendResult<Option<ReceivedMessage>> {
        Ok(self.take(1)?.pop())
    }

    async fn receive_batch(&self, max_wait: Duration) -> BackendResult<Vec<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let batch = self.take(self.service.batch_limit)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(RECEIVE_POLL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_list_and_duplicate() {
        let service = RedbQueueService::open_in_memory(1).unwrap();
        service.create_queue("q-0").await.unwrap();
        service.create_send_only_queue("q-1").await.unwrap();
        service.create_queue("other-0").await.unwrap();

        let err = service.create_queue("q-0").await.unwrap_err();
        assert_eq!(err, BackendError::AlreadyExists("q-0".into()));

        let listed = service.list_queues("q-").await.unwrap();
        let names: Vec<&str> = listed.iter().map(|q| q.name()).collect();
        assert_eq!(names, vec!["q-0", "q-1"]);
        assert!(listed[0].is_receive_enabled());
        assert!(!listed[1].is_receive_enabled());
    }

    #[tokio::test]
    async fn flags_persist_and_are_checked_on_send() {
        let service = RedbQueueService::open_in_memory(1).unwrap();
        let stale = service.create_queue("q-0").await.unwrap();
        service.set_queue_receive_only("q-0").await.unwrap();

        // The old handle still reports its cached flags...
        assert!(stale.is_send_enabled());
        // ...but the committed flags win on the send path.
        assert_eq!(
            stale.send(Message::from("x")).await.unwrap_err(),
            BackendError::SendDisabled("q-0".into())
        );

        let fresh = service.list_queues("q-0").await.unwrap();
        assert!(!fresh[0].is_send_enabled());
        assert!(fresh[0].is_receive_enabled());

        assert_eq!(
            service.set_queue_disabled("nope").await.unwrap_err(),
            BackendError::NotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn fifo_round_trip_updates_size() {
        let service = RedbQueueService::open_in_memory(1).unwrap();
        let queue = service.create_queue("q-0").await.unwrap();

        queue
            .send_batch(vec![Message::from("a"), Message::from("bb"), Message::from("ccc")])
            .await
            .unwrap();
        assert_eq!(queue.current_size_bytes(), 6);

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.body_str(), Some("a"));

        let rest = queue.receive_batch(Duration::ZERO).await.unwrap();
        let bodies: Vec<_> = rest.iter().filter_map(|m| m.body_str()).collect();
        assert_eq!(bodies, vec!["bb", "ccc"]);
        assert_eq!(queue.current_size_bytes(), 0);
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let service = RedbQueueService::open_in_memory(1).unwrap();
        let queue = service.create_queue("q-0").await.unwrap();
        let big = Message::new(vec![0u8; 1024 * 1024 + 1]);
        assert!(matches!(
            queue.send(big).await.unwrap_err(),
            BackendError::QuotaExceeded { .. }
        ));
    }

    #[tokio::test]
    async fn messages_of_sibling_queues_do_not_mix() {
        let service = RedbQueueService::open_in_memory(1).unwrap();
        let a = service.create_queue("q-1").await.unwrap();
        let b = service.create_queue("q-10").await.unwrap();
        a.send(Message::from("from-a")).await.unwrap();
        b.send(Message::from("from-b")).await.unwrap();

        let got = a.receive_batch(Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body_str(), Some("from-a"));
    }

    #[tokio::test]
    async fn scheduled_message_is_hidden_until_due() {
        let service = RedbQueueService::open_in_memory(1).unwrap();
        let queue = service.create_queue("q-0").await.unwrap();
        let at = SystemTime::now() + Duration::from_millis(120);
        queue.send_scheduled(Message::from("later"), at).await.unwrap();

        assert!(queue.receive().await.unwrap().is_none());
        let batch = queue.receive_batch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.redb");
        {
            let service = RedbQueueService::open(&path, 1).unwrap();
            let queue = service.create_queue("q-0").await.unwrap();
            queue.send(Message::from("persisted")).await.unwrap();
        }
        let service = RedbQueueService::open(&path, 1).unwrap();
        let queues = service.list_queues("q-").await.unwrap();
        assert_eq!(queues.len(), 1);
        let msg = queues[0].receive().await.unwrap().unwrap();
        assert_eq!(msg.body_str(), Some("persisted"));
    }

    #[test]
    fn second_open_of_same_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.redb");
        let _first = RedbQueueService::open(&path, 1).unwrap();
        assert!(matches!(
            RedbQueueService::open(&path, 1),
            Err(BackendError::Unavailable(_))
        ));
    }
}
