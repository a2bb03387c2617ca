//! Read-side of the cluster-state machine.
//!
//! Queries are evaluated on the current leader of the cluster group, so every
//! reply reflects a linearizable view of the replicated state.

use armada_core::placement::{lrw_members, NodesPerZone};
use armada_core::types::{GroupName, NodeId, RvConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::state::{ClusterState, NodeFailure};

/// Queries answered by the cluster group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterQuery {
    /// The zone map of active nodes.
    ActiveNodes,
    /// Registered groups and their replica counts.
    ConsensusGroups,
    /// The nodes that should currently host a group, derived by placement.
    DesiredPlacement {
        /// Group name.
        name: GroupName,
    },
    /// The registry entry of one group.
    Group {
        /// Group name.
        name: GroupName,
    },
    /// The last reported leader of a group.
    LeaderHint {
        /// Group name.
        name: GroupName,
    },
    /// Nodes currently carrying a failure record.
    UnhealthyNodes,
}

/// Snapshot of one group's registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    /// Desired replica count.
    pub n_replica: u8,
    /// Opaque engine configuration.
    pub rv_config: RvConfig,
    /// Last reported leader.
    pub leader_node: Option<NodeId>,
    /// Nodes currently reported as hosting a replica.
    pub members: BTreeSet<NodeId>,
}

/// Replies to [`ClusterQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryReply {
    /// Reply to [`ClusterQuery::ActiveNodes`].
    ActiveNodes(NodesPerZone),
    /// Reply to [`ClusterQuery::ConsensusGroups`].
    ConsensusGroups(BTreeMap<GroupName, u8>),
    /// Reply to [`ClusterQuery::DesiredPlacement`]; `None` for unknown groups.
    DesiredPlacement(Option<Vec<NodeId>>),
    /// Reply to [`ClusterQuery::Group`]; `None` for unknown groups.
    Group(Option<GroupView>),
    /// Reply to [`ClusterQuery::LeaderHint`].
    LeaderHint(Option<NodeId>),
    /// Reply to [`ClusterQuery::UnhealthyNodes`].
    UnhealthyNodes(BTreeMap<NodeId, NodeFailure>),
    /// The query bytes did not decode.
    Malformed,
}

/// Evaluate a query against the current state.
pub fn answer_query(state: &ClusterState, query: &ClusterQuery) -> QueryReply {
    match query {
        ClusterQuery::ActiveNodes => QueryReply::ActiveNodes(state.nodes_per_zone.clone()),
        ClusterQuery::ConsensusGroups => QueryReply::ConsensusGroups(
            state
                .groups
                .iter()
                .map(|(name, info)| (name.clone(), info.n_replica))
                .collect(),
        ),
        ClusterQuery::DesiredPlacement { name } => {
            QueryReply::DesiredPlacement(state.groups.get(name).map(|info| {
                lrw_members(
                    &state.nodes_per_zone,
                    name.as_str(),
                    usize::from(info.n_replica),
                )
            }))
        }
        ClusterQuery::Group { name } => {
            QueryReply::Group(state.groups.get(name).map(|info| GroupView {
                n_replica: info.n_replica,
                rv_config: info.rv_config.clone(),
                leader_node: info.leader_node.clone(),
                members: info.members.clone(),
            }))
        }
        ClusterQuery::LeaderHint { name } => QueryReply::LeaderHint(
            state
                .groups
                .get(name)
                .and_then(|info| info.leader_node.clone()),
        ),
        ClusterQuery::UnhealthyNodes => QueryReply::UnhealthyNodes(state.node_failures.clone()),
    }
}
