//! vqueue-client — the virtual queue facade.
//!
//! A `VirtualQueue` looks like one queue to callers. Writes go to the
//! current send shard, reads come from the current receive shard, and the
//! size/capacity accessors sum over every shard:
//!
//! ```text
//! send(msg)     → source.send_shard()    → PhysicalQueue::send
//! receive()     → source.receive_shard() → PhysicalQueue::receive
//! on_receive(f) → pump task: receive_batch(wait) → f(msg) ...
//! ```
//!
//! The shard view is either a monitor owned by the handle (`create`,
//! `open`) or a shared `ShardSource` such as a scaling agent's monitor
//! (`attach`).

pub mod codec;
pub mod queue;
pub mod receiver;

pub use codec::{JSON_CONTENT_TYPE, decode_json, encode_json};
pub use queue::{ClientConfig, VirtualQueue};
pub use receiver::ReceiverHandle;
