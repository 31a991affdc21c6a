//! Error types for virtual queues and their physical backends.

use thiserror::Error;

/// Result type alias for virtual queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type alias for physical backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by shards, monitors, agents and the client facade.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed shard name: {0}")]
    MalformedName(String),

    #[error("no sendable shard for virtual queue {0}")]
    NoSendableShard(String),

    #[error("no receivable shard for virtual queue {0}")]
    NoReceivableShard(String),

    #[error("backend call failed: {0}")]
    BackendUnavailable(#[from] BackendError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("message codec error: {0}")]
    Codec(String),
}

impl QueueError {
    /// The underlying backend error, if this error came from a backend call.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            QueueError::BackendUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors reported by a physical queue or the physical queue service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("queue already exists: {0}")]
    AlreadyExists(String),

    #[error("sending is disabled on queue {0}")]
    SendDisabled(String),

    #[error("receiving is disabled on queue {0}")]
    ReceiveDisabled(String),

    #[error("queue {name} is full ({max_size_megabytes} MB)")]
    QuotaExceeded {
        name: String,
        max_size_megabytes: u64,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BackendError {
    /// Whether this error means the caller's view of the shard topology is
    /// stale (the queue moved to another role or vanished).
    pub fn is_stale_topology(&self) -> bool {
        matches!(
            self,
            BackendError::NotFound(_)
                | BackendError::SendDisabled(_)
                | BackendError::ReceiveDisabled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_converts_into_queue_error() {
        let err: QueueError = BackendError::Unavailable("timeout".into()).into();
        assert!(matches!(err, QueueError::BackendUnavailable(_)));
        assert_eq!(
            err.backend(),
            Some(&BackendError::Unavailable("timeout".into()))
        );
        assert_eq!(
            err.to_string(),
            "backend call failed: backend unavailable: timeout"
        );
    }

    #[test]
    fn stale_topology_classification() {
        assert!(BackendError::SendDisabled("q-0".into()).is_stale_topology());
        assert!(BackendError::NotFound("q-0".into()).is_stale_topology());
        assert!(!BackendError::Unavailable("down".into()).is_stale_topology());
        assert!(
            !BackendError::QuotaExceeded {
                name: "q-0".into(),
                max_size_megabytes: 1
            }
            .is_stale_topology()
        );
    }
}
