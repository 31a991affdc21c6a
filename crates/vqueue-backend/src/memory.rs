//! In-process physical queue backend.
//!
//! Every `MemoryQueue` handle shares its state with the service, so flag
//! changes made through the service are visible immediately through any
//! handle previously returned by `list_queues` or `create_*`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use vqueue_core::{
    BackendError, BackendResult, Message, ReceivedMessage, SendReceipt, capacity_bytes,
};

use crate::capability::{PhysicalQueue, QueueService, epoch_millis, now_millis};

/// Maximum messages returned by one `receive_batch` unless overridden.
pub const DEFAULT_BATCH_LIMIT: usize = 32;

/// Queue service holding all queues in process memory.
#[derive(Clone)]
pub struct MemoryQueueService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    /// Queue name → shared queue state.
    queues: Mutex<BTreeMap<String, Arc<MemoryQueue>>>,
    max_size_megabytes: u64,
    batch_limit: usize,
}

impl MemoryQueueService {
    /// Create a service whose queues each hold `max_size_megabytes`.
    pub fn new(max_size_megabytes: u64) -> Self {
        Self::with_batch_limit(max_size_megabytes, DEFAULT_BATCH_LIMIT)
    }

    pub fn with_batch_limit(max_size_megabytes: u64, batch_limit: usize) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                queues: Mutex::new(BTreeMap::new()),
                max_size_megabytes,
                batch_limit: batch_limit.max(1),
            }),
        }
    }

    /// Direct handle to a queue, for inspection.
    pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner.queues.lock().expect("queues lock").get(name).cloned()
    }

    /// Names of every queue, in name order.
    pub fn queue_names(&self) -> Vec<String> {
        self.inner
            .queues
            .lock()
            .expect("queues lock")
            .keys()
            .cloned()
            .collect()
    }

    fn create(&self, name: &str, send: bool, receive: bool) -> BackendResult<Arc<dyn PhysicalQueue>> {
        let mut queues = self.inner.queues.lock().expect("queues lock");
        if queues.contains_key(name) {
            return Err(BackendError::AlreadyExists(name.to_string()));
        }
        let queue = Arc::new(MemoryQueue::new(
            name,
            self.inner.max_size_megabytes,
            self.inner.batch_limit,
            send,
            receive,
        ));
        queues.insert(name.to_string(), Arc::clone(&queue));
        debug!(queue = %name, send, receive, "memory queue created");
        Ok(queue)
    }

    fn set_flags(&self, name: &str, send: bool, receive: bool) -> BackendResult<()> {
        let queue = self
            .queue(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        queue.set_flags(send, receive);
        debug!(queue = %name, send, receive, "memory queue flags updated");
        Ok(())
    }
}

#[async_trait]
impl QueueService for MemoryQueueService {
    async fn create_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>> {
        self.create(name, true, true)
    }

    async fn create_send_only_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>> {
        self.create(name, true, false)
    }

    async fn list_queues(&self, prefix: &str) -> BackendResult<Vec<Arc<dyn PhysicalQueue>>> {
        let queues = self.inner.queues.lock().expect("queues lock");
        Ok(queues
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, q)| Arc::clone(q) as Arc<dyn PhysicalQueue>)
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

// ── Queue ──────────────────────────────────────────────────────────

/// A single in-memory physical queue.
pub struct MemoryQueue {
    name: String,
    max_size_megabytes: u64,
    batch_limit: usize,
    state: Mutex<QueueState>,
    /// Woken whenever messages are enqueued.
    arrivals: Notify,
}

struct QueueState {
    send_enabled: bool,
    receive_enabled: bool,
    size_bytes: u64,
    next_sequence: u64,
    /// Messages in sequence order; scheduled ones stay until visible.
    messages: VecDeque<StoredMessage>,
}

struct StoredMessage {
    sequence: u64,
    body: Bytes,
    content_type: Option<String>,
    enqueued_at: u64,
    visible_at: u64,
}

impl MemoryQueue {
    fn new(
        name: &str,
        max_size_megabytes: u64,
        batch_limit: usize,
        send_enabled: bool,
        receive_enabled: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            max_size_megabytes,
            batch_limit,
            state: Mutex::new(QueueState {
                send_enabled,
                receive_enabled,
                size_bytes: 0,
                next_sequence: 0,
                messages: VecDeque::new(),
            }),
            arrivals: Notify::new(),
        }
    }

    /// Number of stored messages, scheduled ones included.
    pub fn message_count(&self) -> usize {
        self.state.lock().expect("queue lock").messages.len()
    }

    fn set_flags(&self, send: bool, receive: bool) {
        let mut state = self.state.lock().expect("queue lock");
        state.send_enabled = send;
        state.receive_enabled = receive;
    }

    fn enqueue(&self, messages: Vec<Message>, visible_at: u64) -> BackendResult<SendReceipt> {
        let mut state = self.state.lock().expect("queue lock");
        if !state.send_enabled {
            return Err(BackendError::SendDisabled(self.name.clone()));
        }

        let incoming: u64 = messages.iter().map(Message::size_bytes).sum();
        if state.size_bytes.saturating_add(incoming) > capacity_bytes(self.max_size_megabytes) {
            return Err(BackendError::QuotaExceeded {
                name: self.name.clone(),
                max_size_megabytes: self.max_size_megabytes,
            });
        }

        let first_sequence = state.next_sequence;
        let accepted = messages.len();
        let enqueued_at = now_millis();
        for message in messages {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.messages.push_back(StoredMessage {
                sequence,
                body: message.body,
                content_type: message.content_type,
                enqueued_at,
                visible_at,
            });
        }
        state.size_bytes += incoming;
        drop(state);

        self.arrivals.notify_waiters();
        Ok(SendReceipt {
            accepted,
            first_sequence,
        })
    }

    fn take(&self, limit: usize) -> BackendResult<Vec<ReceivedMessage>> {
        let mut state = self.state.lock().expect("queue lock");
        if !state.receive_enabled {
            return Err(BackendError::ReceiveDisabled(self.name.clone()));
        }

        let now = now_millis();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(state.messages.len());
        for message in state.messages.drain(..) {
            if taken.len() < limit && message.visible_at <= now {
                taken.push(message);
            } else {
                kept.push_back(message);
            }
        }
        state.messages = kept;

        let released: u64 = taken.iter().map(|m| m.body.len() as u64).sum();
        state.size_bytes = state.size_bytes.saturating_sub(released);

        Ok(taken
            .into_iter()
            .map(|m| ReceivedMessage {
                sequence: m.sequence,
                body: m.body,
                content_type: m.content_type,
                enqueued_at: m.enqueued_at,
            })
            .collect())
    }

    /// Time until the earliest scheduled message becomes visible.
    fn next_due_in(&self) -> Option<Duration> {
        let state = self.state.lock().expect("queue lock");
        let now = now_millis();
        state
            .messages
            .iter()
            .filter(|m| m.visible_at > now)
            .map(|m| Duration::from_millis(m.visible_at - now))
            .min()
    }
}

#[async_trait]
impl PhysicalQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_size_megabytes(&self) -> u64 {
        self.max_size_megabytes
    }

    fn current_size_bytes(&self) -> u64 {
        self.state.lock().expect("queue lock").size_bytes
    }

    fn is_send_enabled(&self) -> bool {
        self.state.lock().expect("queue lock").send_enabled
    }

    fn is_receive_enabled(&self) -> bool {
        self.state.lock().expect("queue lock").receive_enabled
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
            // Register interest before checking so a concurrent send is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take(self.batch_limit)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let mut wait = deadline - now;
            if let Some(due) = self.next_due_in() {
                wait = wait.min(due);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let service = MemoryQueueService::new(1);
        service.create_queue("q-0").await.unwrap();
        let err = service.create_send_only_queue("q-0").await.unwrap_err();
        assert_eq!(err, BackendError::AlreadyExists("q-0".into()));
    }

    #[tokio::test]
    async fn unbounded_capacity_accepts_sends() {
        let service = MemoryQueueService::new(u64::MAX);
        let queue = service.create_queue("q-0").await.unwrap();
        queue.send(Message::new(vec![0u8; 16])).await.unwrap();
        queue.send(Message::new(vec![0u8; 16])).await.unwrap();
        assert_eq!(queue.current_size_bytes(), 32);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_in_name_order() {
        let service = MemoryQueueService::new(1);
        for name in ["q-1", "q-0", "other-0", "q-10"] {
            service.create_queue(name).await.unwrap();
        }
        let names: Vec<String> = service
            .list_queues("q-")
            .await
            .unwrap()
            .iter()
            .map(|q| q.name().to_string())
            .collect();
        assert_eq!(names, vec!["q-0", "q-1", "q-10"]);
    }

    #[tokio::test]
    async fn flag_changes_are_visible_through_existing_handles() {
        let service = MemoryQueueService::new(1);
        let handle = service.create_queue("q-0").await.unwrap();
        assert!(handle.is_send_enabled() && handle.is_receive_enabled());

        service.set_queue_receive_only("q-0").await.unwrap();
        assert!(!handle.is_send_enabled());
        assert!(handle.is_receive_enabled());

        service.set_queue_disabled("q-0").await.unwrap();
        assert!(!handle.is_receive_enabled());

        let err = service.set_queue_enabled("missing").await.unwrap_err();
        assert_eq!(err, BackendError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn fifo_send_and_receive_tracks_size() {
        let service = MemoryQueueService::new(1);
        let queue = service.create_queue("q-0").await.unwrap();

        queue.send(Message::from("one")).await.unwrap();
        let receipt = queue
            .send_batch(vec![Message::from("two"), Message::from("three")])
            .await
            .unwrap();
        assert_eq!(receipt.accepted, 2);
        assert_eq!(receipt.first_sequence, 1);
        assert_eq!(queue.current_size_bytes(), 11);

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.body_str(), Some("one"));
        let rest = queue.receive_batch(Duration::from_millis(10)).await.unwrap();
        let bodies: Vec<_> = rest.iter().filter_map(|m| m.body_str()).collect();
        assert_eq!(bodies, vec!["two", "three"]);
        assert_eq!(queue.current_size_bytes(), 0);
    }

    #[tokio::test]
    async fn disabled_directions_are_rejected() {
        let service = MemoryQueueService::new(1);
        let queue = service.create_send_only_queue("q-1").await.unwrap();
        assert_eq!(
            queue.receive().await.unwrap_err(),
            BackendError::ReceiveDisabled("q-1".into())
        );

        service.set_queue_disabled("q-1").await.unwrap();
        assert_eq!(
            queue.send(Message::from("x")).await.unwrap_err(),
            BackendError::SendDisabled("q-1".into())
        );
    }

    #[tokio::test]
    async fn batch_over_capacity_stores_nothing() {
        let service = MemoryQueueService::new(1);
        let queue = service.create_queue("q-0").await.unwrap();
        let half = Bytes::from(vec![0u8; 600 * 1024]);

        let err = queue
            .send_batch(vec![Message::new(half.clone()), Message::new(half)])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::QuotaExceeded { .. }));
        assert_eq!(queue.current_size_bytes(), 0);
    }

    #[tokio::test]
    async fn receive_batch_respects_batch_limit() {
        let service = MemoryQueueService::with_batch_limit(1, 2);
        let queue = service.create_queue("q-0").await.unwrap();
        for i in 0..5 {
            queue.send(Message::from(format!("m{i}"))).await.unwrap();
        }
        let batch = queue.receive_batch(Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].sequence, 0);
    }

    #[tokio::test]
    async fn receive_batch_times_out_empty() {
        let service = MemoryQueueService::new(1);
        let queue = service.create_queue("q-0").await.unwrap();
        let batch = queue.receive_batch(Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn receive_batch_wakes_on_send() {
        let service = MemoryQueueService::new(1);
        let queue = service.create_queue("q-0").await.unwrap();

        let sender = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send(Message::from("late")).await.unwrap();
        });

        let batch = queue.receive_batch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body_str(), Some("late"));
    }

    #[tokio::test]
    async fn scheduled_messages_stay_hidden_until_due() {
        let service = MemoryQueueService::new(1);
        let queue = service.create_queue("q-0").await.unwrap();

        let at = SystemTime::now() + Duration::from_millis(100);
        queue.send_scheduled(Message::from("later"), at).await.unwrap();
        queue.send(Message::from("now")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.body_str(), Some("now"));
        assert!(queue.receive().await.unwrap().is_none());
        // Scheduled messages still count against capacity.
        assert_eq!(queue.current_size_bytes(), 5);

        let batch = queue.receive_batch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body_str(), Some("later"));
    }
}
