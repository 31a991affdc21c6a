//! vqueue-autoscale — the scaling agent.
//!
//! One agent per virtual queue. Every tick:
//!
//! ```text
//! send shard S = highest sendable shard in the monitor snapshot
//! if utilization(S) > threshold:
//!     create_send_only_queue("{queue}-{S.index + 1}")   (AlreadyExists is fine)
//!     refresh monitor
//! reconcile:
//!     one shard          → Enabled
//!     lowest of many     → ReceiveOnly
//!     middle shards      → Disabled
//!     highest            → left alone (warn if not sendable)
//! ```
//!
//! Every transition is issued only when the shard's reported state differs
//! from its target, so a converged queue costs no mutating calls.

pub mod agent;
pub mod reconcile;

pub use agent::{AgentConfig, ScaleOut, ScalingAgent, TickReport};
pub use reconcile::{TargetState, Transition, plan_transitions};
