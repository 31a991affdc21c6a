//! Recording service double for test suites.
//!
//! `RecordingService` wraps another `QueueService`, records every call it
//! forwards, and can be told to fail the next N calls of an operation with
//! `BackendError::Unavailable`. A call can also be held after the wrapped
//! service answered and before the answer is returned, to interleave it
//! with other work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use vqueue_core::{BackendError, BackendResult};

use crate::capability::{PhysicalQueue, QueueService};

/// Service operations, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateQueue,
    CreateSendOnlyQueue,
    ListQueues,
    SetQueueEnabled,
    SetQueueReceiveOnly,
    SetQueueDisabled,
}

/// One recorded call: the operation and the name or prefix it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    pub operation: Operation,
    pub target: String,
}

/// A `QueueService` that records calls and injects failures.
#[derive(Clone)]
pub struct RecordingService {
    inner: Arc<dyn QueueService>,
    calls: Arc<Mutex<Vec<ServiceCall>>>,
    failures: Arc<Mutex<HashMap<Operation, usize>>>,
    holds: Arc<Mutex<HashMap<Operation, Hold>>>,
}

/// The service side of a held call.
struct Hold {
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// The test side of a held call, returned by `RecordingService::hold_next`.
pub struct HeldCall {
    reached: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl HeldCall {
    /// Wait until the held call has its answer and is parked.
    pub async fn reached(&mut self) {
        let _ = (&mut self.reached).await;
    }

    /// Let the held call return.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

impl RecordingService {
    pub fn new(inner: Arc<dyn QueueService>) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            holds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Park the next call of `operation` after the wrapped service has
    /// answered it, until the returned handle is released.
    pub fn hold_next(&self, operation: Operation) -> HeldCall {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.holds.lock().expect("holds lock").insert(
            operation,
            Hold {
                reached: reached_tx,
                release: release_rx,
            },
        );
        HeldCall {
            reached: reached_rx,
            release: release_tx,
        }
    }

    async fn park_if_held(&self, operation: Operation) {
        let hold = self.holds.lock().expect("holds lock").remove(&operation);
        if let Some(hold) = hold {
            let _ = hold.reached.send(());
            let _ = hold.release.await;
        }
    }

    /// Fail the next `times` calls of `operation`. Failed calls are still
    /// recorded.
    pub fn fail_next(&self, operation: Operation, times: usize) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(operation, times);
    }

    /// Every recorded call, oldest first.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Number of recorded calls of `operation`.
    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Targets of every recorded call of `operation`, oldest first.
    pub fn targets(&self, operation: Operation) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Number of state-transition calls (`set_queue_*`).
    pub fn transition_count(&self) -> usize {
        self.count(Operation::SetQueueEnabled)
            + self.count(Operation::SetQueueReceiveOnly)
            + self.count(Operation::SetQueueDisabled)
    }

    pub fn clear(&self) {
        self.calls.lock().expect("calls lock").clear();
    }

    fn record(&self, operation: Operation, target: &str) -> BackendResult<()> {
        self.calls.lock().expect("calls lock").push(ServiceCall {
            operation,
            target: target.to_string(),
        });

        let mut failures = self.failures.lock().expect("failures lock");
        match failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BackendError::Unavailable(format!(
                    "injected {operation:?} failure for {target}"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl QueueService for RecordingService {
    async fn create_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>> {
        self.record(Operation::CreateQueue, name)?;
        let result = self.inner.create_queue(name).await;
        self.park_if_held(Operation::CreateQueue).await;
        result
    }

    async fn create_send_only_queue(&self, name: &str) -> BackendResult<Arc<dyn PhysicalQueue>> {
        self.record(Operation::CreateSendOnlyQueue, name)?;
        let result = self.inner.create_send_only_queue(name).await;
        self.park_if_held(Operation::CreateSendOnlyQueue).await;
        result
    }

    async fn list_queues(&self, prefix: &str) -> BackendResult<Vec<Arc<dyn PhysicalQueue>>> {
        self.record(Operation::ListQueues, prefix)?;
        let result = self.inner.list_queues(prefix).await;
        self.park_if_held(Operation::ListQueues).await;
        result
    }

    async fn set_queue_enabled(&self, name: &str) -> BackendResult<()> {
        self.record(Operation::SetQueueEnabled, name)?;
        let result = self.inner.set_queue_enabled(name).await;
        self.park_if_held(Operation::SetQueueEnabled).await;
        result
    }

    async fn set_queue_receive_only(&self, name: &str) -> BackendResult<()> {
        self.record(Operation::SetQueueReceiveOnly, name)?;
        let result = self.inner.set_queue_receive_only(name).await;
        self.park_if_held(Operation::SetQueueReceiveOnly).await;
        result
    }

    async fn set_queue_disabled(&self, name: &str) -> BackendResult<()> {
        self.record(Operation::SetQueueDisabled, name)?;
        let result = self.inner.set_queue_disabled(name).await;
        self.park_if_held(Operation::SetQueueDisabled).await;
        result
    }
}
