//! Capability traits for physical queues and the service that manages them.
//!
//! A physical queue is one bounded queue in the managed backend. The
//! service creates queues, lists them by name prefix, and flips their
//! send/receive flags. Neither trait offers multi-queue atomicity.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use vqueue_core::{BackendResult, Message, ReceivedMessage, SendReceipt};

/// One bounded queue in the backend.
///
/// The size and flag accessors report the backend's last known values and
/// never perform I/O.
#[async_trait]
pub trait PhysicalQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Storage capacity in megabytes.
    fn max_size_megabytes(&self) -> u64;

    /// Bytes currently stored, scheduled messages included.
    fn current_size_bytes(&self) -> u64;

    fn is_send_enabled(&self) -> bool;

    fn is_receive_enabled(&self) -> bool;

    /// Enqueue one message, returning its sequence number.
    async fn send(&self, message: Message) -> BackendResult<u64>;

    /// Enqueue one message that stays invisible to receivers until `at`.
    async fn send_scheduled(&self, message: Message, at: SystemTime) -> BackendResult<u64>;

    /// Enqueue a batch atomically: either every message fits or none is stored.
    async fn send_batch(&self, messages: Vec<Message>) -> BackendResult<SendReceipt>;

    /// Take the oldest visible message, if any, without waiting.
    async fn receive(&self) -> BackendResult<Option<ReceivedMessage>>;

    /// Wait up to `max_wait` for at least one visible message and take as
    /// many as the backend's batch limit allows. Returns an empty batch on
    /// timeout.
    async fn receive_batch(&self, max_wait: Duration) -> BackendResult<Vec<ReceivedMessage>>;
}

impl fmt::Debug for dyn PhysicalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalQueue")
            .field("name", &self.name())
            .field("max_size_megabytes", &self.max_size_megabytes())
            .field("current_size_bytes", &self.current_size_bytes())
            .field("send", &self.is_send_enabled())
            .field("receive", &self.is_receive_enabled())
            .finish()
    }
}

/// Lifecycle operations over physical queues.
///
/// Creating a queue that already exists fails with
/// `BackendError::AlreadyExists`; callers that retry creation treat that as
/// success. The `set_*` operations are idempotent.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create a queue with sending and receiving enabled.
    async fn create_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>>;

    /// Create a queue with sending enabled and receiving disabled.
    async fn create_send_only_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>>;

    /// All queues whose name starts with `prefix`, in name order.
    async fn list_queues(&self, prefix: &str) -> BackendResult<Vec<Arc<dyn PhysicalQueue>>>;

    async fn set_queue_enabled(&self, name: &str) -> BackendResult<()>;

    async fn set_queue_receive_only(&self, name: &str) -> BackendResult<()>;

    async fn set_queue_disabled(&self, name: &str) -> BackendResult<()>;
}

pub(crate) fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn now_millis() -> u64 {
    epoch_millis(SystemTime::now())
}
