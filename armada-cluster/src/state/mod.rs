//! The replicated cluster-state machine.
//!
//! The fleet's root of trust: zone membership, registered groups with their
//! placements, tombstones, and node-health records. Commands mutate the state
//! deterministically ([`apply`]), queries read it on the leader ([`query`]),
//! and [`machine`] adapts both to the byte-level seam the consensus engine
//! speaks.

mod apply;
mod machine;
mod query;
#[allow(clippy::module_inception)]
mod state;

pub use apply::{apply_command, CommandOutcome};
pub use machine::{ClusterMachine, OpaqueMachine};
pub use query::{answer_query, ClusterQuery, GroupView, QueryReply};
pub use state::{ClusterState, GroupInfo, NodeFailure};
