//! Cluster commands - mutations that go through the cluster group.
//!
//! Every change to the replicated fleet state travels as one of these
//! commands. Commands are serialized into the consensus log and applied
//! deterministically on every replica, so any wall-clock input rides inside
//! the command instead of being read during apply.

use armada_core::types::{GroupName, NodeId, RvConfig, ZoneId};
use serde::{Deserialize, Serialize};

/// Name of the distinguished cluster group that replicates the fleet state.
pub const CLUSTER_GROUP: &str = "armada.cluster";

/// The cluster group's name as a [`GroupName`].
#[must_use]
pub fn cluster_group() -> GroupName {
    GroupName::new(CLUSTER_GROUP)
}

/// Commands replicated through the cluster group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterCommand {
    /// Add a node to a zone, removing any prior entry in another zone.
    Activate {
        /// Node being activated.
        node: NodeId,
        /// Zone the node joins.
        zone: ZoneId,
    },

    /// Remove a node from its zone and drop its failure record.
    ///
    /// Member sets are left untouched; managers rebalance them afterwards.
    Deactivate {
        /// Node being deactivated.
        node: NodeId,
    },

    /// Register a consensus group with an empty member set.
    AddGroup {
        /// Group name.
        name: GroupName,
        /// Desired replica count.
        n_replica: u8,
        /// Opaque engine configuration for the group's replicas.
        rv_config: RvConfig,
        /// Where clients should look for the first leader, if known.
        leader_hint: Option<NodeId>,
    },

    /// Move a group from the registry to the tombstone set.
    RemoveGroup {
        /// Group name.
        name: GroupName,
        /// Removal timestamp.
        removed_at_ms: u64,
    },

    /// Record that a node now hosts a replica of a group.
    ReportMemberUp {
        /// Group name.
        name: GroupName,
        /// Hosting node.
        node: NodeId,
    },

    /// Record that a node no longer hosts a replica of a group.
    ReportMemberDown {
        /// Group name.
        name: GroupName,
        /// Former hosting node.
        node: NodeId,
    },

    /// Record the observed leader of a group.
    ReportLeader {
        /// Group name.
        name: GroupName,
        /// Leader node.
        node: NodeId,
    },

    /// Update a node's failure record.
    ///
    /// A count of zero clears the record.
    RecordNodeFailure {
        /// Node being reported.
        node: NodeId,
        /// Number of its replicas currently failing.
        failing_group_count: u32,
        /// Observation timestamp.
        observed_at_ms: u64,
    },

    /// Remove a node from the zone map and from every member set.
    PurgeNode {
        /// Node being purged.
        node: NodeId,
    },

    /// Drop tombstones older than the time-to-live.
    ExpireTombstones {
        /// Current timestamp.
        now_ms: u64,
        /// Tombstone time-to-live.
        ttl_ms: u64,
    },
}

impl ClusterCommand {
    /// Get a human-readable name for this command type.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterCommand::Activate { .. } => "Activate",
            ClusterCommand::Deactivate { .. } => "Deactivate",
            ClusterCommand::AddGroup { .. } => "AddGroup",
            ClusterCommand::RemoveGroup { .. } => "RemoveGroup",
            ClusterCommand::ReportMemberUp { .. } => "ReportMemberUp",
            ClusterCommand::ReportMemberDown { .. } => "ReportMemberDown",
            ClusterCommand::ReportLeader { .. } => "ReportLeader",
            ClusterCommand::RecordNodeFailure { .. } => "RecordNodeFailure",
            ClusterCommand::PurgeNode { .. } => "PurgeNode",
            ClusterCommand::ExpireTombstones { .. } => "ExpireTombstones",
        }
    }
}
