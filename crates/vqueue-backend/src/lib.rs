//! vqueue-backend — physical queue capabilities.
//!
//! Defines the two traits the control plane consumes from a managed
//! queuing backend, plus two implementations of them:
//!
//! ```text
//! QueueService (create / list by prefix / set flags)
//!   └── PhysicalQueue (bounded FIFO, send + receive flags)
//!
//! MemoryQueueService  in-process, handles share live state
//! RedbQueueService    persisted in a redb file
//! ```
//!
//! With the `testing` feature, `testing::RecordingService` wraps any
//! service to count calls and inject failures.

pub mod capability;
pub mod memory;
pub mod redb_store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capability::{PhysicalQueue, QueueService};
pub use memory::{MemoryQueue, MemoryQueueService};
pub use redb_store::RedbQueueService;
