//! Shard naming, shard states, and the messages carried by physical queues.

use std::fmt;
use std::sync::LazyLock;

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Bytes in one megabyte, as used for capacity math.
pub const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Capacity in bytes of a queue limited to `max_size_megabytes`, saturating
/// at `u64::MAX`.
pub fn capacity_bytes(max_size_megabytes: u64) -> u64 {
    max_size_megabytes.saturating_mul(BYTES_PER_MEGABYTE)
}

static TRAILING_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)$").expect("static regex"));

// ── Naming ─────────────────────────────────────────────────────────

/// Physical queue name for shard `index` of virtual queue `queue`.
pub fn shard_name(queue: &str, index: u64) -> String {
    format!("{queue}-{index}")
}

/// Name prefix shared by every shard of virtual queue `queue`.
pub fn shard_prefix(queue: &str) -> String {
    format!("{queue}-")
}

/// Parse a shard index from the longest run of trailing decimal digits.
///
/// `orders-12` and `orders12` both parse to `12`. A name without trailing
/// digits, or whose digits overflow `u64`, is a `MalformedName`.
pub fn parse_shard_index(name: &str) -> QueueResult<u64> {
    let digits = TRAILING_DIGITS
        .captures(name)
        .and_then(|c| c.get(1))
        .ok_or_else(|| QueueError::MalformedName(name.to_string()))?;
    digits
        .as_str()
        .parse::<u64>()
        .map_err(|_| QueueError::MalformedName(name.to_string()))
}

/// Validate a virtual queue name supplied by a caller.
pub fn validate_queue_name(name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::InvalidArgument(
            "virtual queue name must not be empty".into(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(QueueError::InvalidArgument(format!(
            "virtual queue name {name:?} must not contain whitespace"
        )));
    }
    Ok(())
}

// ── Shard state ────────────────────────────────────────────────────

/// Role of a shard, derived from its physical queue's send/receive flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Accepts sends and receives.
    Enabled,
    /// Accepts sends only.
    SendOnly,
    /// Accepts receives only.
    ReceiveOnly,
    /// Accepts neither.
    Disabled,
}

impl ShardState {
    pub fn from_flags(send_enabled: bool, receive_enabled: bool) -> Self {
        match (send_enabled, receive_enabled) {
            (true, true) => ShardState::Enabled,
            (true, false) => ShardState::SendOnly,
            (false, true) => ShardState::ReceiveOnly,
            (false, false) => ShardState::Disabled,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, ShardState::Enabled | ShardState::SendOnly)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, ShardState::Enabled | ShardState::ReceiveOnly)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Enabled => "enabled",
            ShardState::SendOnly => "send_only",
            ShardState::ReceiveOnly => "receive_only",
            ShardState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

// ── Messages ───────────────────────────────────────────────────────

/// An outgoing message. The payload is opaque to the virtual queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Storage charged against a physical queue's capacity.
    pub fn size_bytes(&self) -> u64 {
        self.body.len() as u64
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::new(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::new(v)
    }
}

/// A message taken off a physical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Per-queue sequence number assigned at enqueue time.
    pub sequence: u64,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Unix timestamp (milliseconds) when the message was enqueued.
    pub enqueued_at: u64,
}

impl ReceivedMessage {
    /// Body as UTF-8, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Outcome of a batch send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendReceipt {
    /// Number of messages accepted.
    pub accepted: usize,
    /// Sequence number of the first accepted message.
    pub first_sequence: u64,
}
