//! vqueue-core — shared types for the virtual queue workspace.
//!
//! Holds the error taxonomy, the shard naming convention, the message
//! types exchanged with physical queues, and the `vqueue.toml` config
//! parser. Every other crate in the workspace depends on this one.

pub mod config;
pub mod error;
pub mod types;

pub use config::{QueueSettings, VqueueConfig, parse_duration, validate_threshold};
pub use error::{BackendError, BackendResult, QueueError, QueueResult};
pub use types::*;
