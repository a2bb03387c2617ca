//! Zone-aware rendezvous placement of replicas.
//!
//! `lrw_members` picks the nodes that should host replicas of a task
//! (lowest-random-weight selection). Each zone ranks its own nodes by hash,
//! then the zone-local ranks interleave globally: every zone contributes its
//! rank-0 pick before any zone contributes a rank-1 pick, so replicas spread
//! across zones before doubling up inside one. Within a rank the hash order
//! gives the rendezvous property: adding or removing a node only perturbs a
//! small fraction of placements.

use crate::hash::rendezvous_hash;
use crate::types::{NodeId, ZoneId};
use std::collections::{BTreeMap, BTreeSet};

/// Map of active nodes keyed by availability zone.
pub type NodesPerZone = BTreeMap<ZoneId, BTreeSet<NodeId>>;

/// Select the `n_to_take` nodes that should host replicas of `task_id`.
///
/// Returns fewer than `n_to_take` nodes when the cluster is smaller than
/// that; empty zones contribute nothing. Ordering is fully deterministic:
/// ties on (rank, hash) break on the node id.
#[must_use]
pub fn lrw_members(nodes_per_zone: &NodesPerZone, task_id: &str, n_to_take: usize) -> Vec<NodeId> {
    let mut ranked: Vec<(usize, u64, NodeId)> = Vec::new();

    for nodes in nodes_per_zone.values() {
        let mut in_zone: Vec<(u64, NodeId)> = nodes
            .iter()
            .map(|node| (rendezvous_hash(node, task_id), node.clone()))
            .collect();
        in_zone.sort();
        ranked.extend(
            in_zone
                .into_iter()
                .enumerate()
                .map(|(rank, (hash, node))| (rank, hash, node)),
        );
    }

    ranked.sort();
    ranked.truncate(n_to_take);
    ranked.into_iter().map(|(_, _, node)| node).collect()
}
