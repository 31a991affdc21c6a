//! Reconciliation planning — which shard needs which state.
//!
//! Planning is pure: it reads the flags each shard reports and returns the
//! transitions needed to reach the positional invariant. Shards already in
//! their target state produce no transition, which is what makes repeated
//! passes idempotent.

use serde::Serialize;

use vqueue_core::ShardState;
use vqueue_shard::{Shard, ShardSet};

/// States the queue service can put a shard into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Enabled,
    ReceiveOnly,
    Disabled,
}

impl TargetState {
    pub fn as_shard_state(self) -> ShardState {
        match self {
            TargetState::Enabled => ShardState::Enabled,
            TargetState::ReceiveOnly => ShardState::ReceiveOnly,
            TargetState::Disabled => ShardState::Disabled,
        }
    }
}

/// One state change the agent should request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub shard: String,
    pub index: u64,
    pub from: ShardState,
    pub to: TargetState,
}

impl Transition {
    fn new(shard: &Shard, to: TargetState) -> Self {
        Self {
            shard: shard.name().to_string(),
            index: shard.index(),
            from: shard.state(),
            to,
        }
    }
}

/// Plan the transitions that bring `shards` to the positional invariant:
///
/// ```text
/// [only]                     → Enabled
/// [lowest, middle.., highest] → lowest ReceiveOnly, middle Disabled
/// ```
///
/// The highest shard is left alone: it is created send-only and the
/// service has no operation that makes a shard send-only afterwards.
pub fn plan_transitions(shards: &ShardSet) -> Vec<Transition> {
    let mut plan = Vec::new();
    match shards.as_slice() {
        [] => {}
        [only] => {
            if only.state() != ShardState::Enabled {
                plan.push(Transition::new(only, TargetState::Enabled));
            }
        }
        [lowest, middle @ .., _highest] => {
            if lowest.state() != ShardState::ReceiveOnly {
                plan.push(Transition::new(lowest, TargetState::ReceiveOnly));
            }
            for shard in middle {
                if shard.state() != ShardState::Disabled {
                    plan.push(Transition::new(shard, TargetState::Disabled));
                }
            }
        }
    }
    plan
}
