//! The replicated fleet state.

use armada_core::placement::NodesPerZone;
use armada_core::types::{GroupName, NodeId, RvConfig, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Registry entry for one consensus group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Desired replica count.
    pub n_replica: u8,
    /// Opaque engine configuration for the group's replicas.
    pub rv_config: RvConfig,
    /// Last reported leader, always a member when set.
    pub leader_node: Option<NodeId>,
    /// Nodes currently hosting a replica, never more than `n_replica`.
    pub members: BTreeSet<NodeId>,
}

/// Health record of a node with unresponsive replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    /// When the node was first seen failing.
    pub first_failure_at_ms: u64,
    /// Number of its replicas failing at the last probe.
    pub failing_group_count: u32,
}

/// The state replicated by the cluster group.
///
/// BTree containers keep snapshots byte-stable across replicas. A node
/// appears in at most one zone; `groups` and `recently_removed` never share
/// a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Active nodes keyed by availability zone.
    pub nodes_per_zone: NodesPerZone,
    /// Registered consensus groups.
    pub groups: BTreeMap<GroupName, GroupInfo>,
    /// Recently removed groups and their removal timestamps.
    pub recently_removed: BTreeMap<GroupName, u64>,
    /// Nodes currently considered unhealthy.
    pub node_failures: BTreeMap<NodeId, NodeFailure>,
}

impl ClusterState {
    /// Zone a node is currently active in, if any.
    #[must_use]
    pub fn zone_of(&self, node: &NodeId) -> Option<&ZoneId> {
        self.nodes_per_zone
            .iter()
            .find(|(_, nodes)| nodes.contains(node))
            .map(|(zone, _)| zone)
    }

    /// Whether the node is active in some zone.
    #[must_use]
    pub fn is_active(&self, node: &NodeId) -> bool {
        self.zone_of(node).is_some()
    }

    /// Total number of active nodes across all zones.
    #[must_use]
    pub fn active_node_count(&self) -> usize {
        self.nodes_per_zone.values().map(BTreeSet::len).sum()
    }

    /// Remove a node from whichever zone holds it, pruning emptied zones.
    pub(crate) fn drop_from_zones(&mut self, node: &NodeId) {
        for nodes in self.nodes_per_zone.values_mut() {
            nodes.remove(node);
        }
        self.nodes_per_zone.retain(|_, nodes| !nodes.is_empty());
    }
}
