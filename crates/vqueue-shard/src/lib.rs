//! vqueue-shard — shards and the shard-set monitor.
//!
//! A shard is one bounded physical queue named `{queue}-{index}`. The
//! monitor keeps a locally cached, index-ordered snapshot of all shards of
//! one virtual queue and answers two questions:
//!
//! ```text
//! send shard     = highest index with sending enabled
//! receive shard  = lowest index with receiving enabled
//! ```
//!
//! During a scale-out two shards may briefly accept sends; the "highest
//! index wins" rule keeps the answer unambiguous.
//!
//! # Architecture
//!
//! ```text
//! ShardSetMonitor
//!   ├── Poller (list_queues(prefix) → Vec<Shard> → ShardSet)
//!   ├── watch::Sender<Arc<ShardSet>>  (snapshot swap, no in-place edits)
//!   └── Background poll loop (watch::Sender<bool> shutdown, JoinHandle)
//! ```

pub mod monitor;
pub mod shard;
pub mod source;

pub use monitor::{MonitorConfig, ShardSetMonitor};
pub use shard::{Shard, ShardSet, ShardSummary};
pub use source::{ShardSource, StaticShardSource};
