//! Process-wide cache of believed group leaders.
//!
//! Entries are hints: any cached handle may point at a node that lost
//! leadership long ago, and every caller copes with that by evicting on
//! failure and re-resolving. Last writer wins on a key.

use armada_core::types::{GroupName, ReplicaRef};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Map of group name to the last known leader handle.
#[derive(Debug, Default)]
pub struct LeaderCache {
    entries: RwLock<HashMap<GroupName, ReplicaRef>>,
}

impl LeaderCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cached leader of a group.
    #[must_use]
    pub fn get(&self, group: &GroupName) -> Option<ReplicaRef> {
        self.entries.read().get(group).cloned()
    }

    /// Record a leader handle.
    pub fn set(&self, replica: ReplicaRef) {
        self.entries.write().insert(replica.group.clone(), replica);
    }

    /// Drop the entry for a group.
    pub fn unset(&self, group: &GroupName) {
        self.entries.write().remove(group);
    }

    /// Snapshot of every entry, for the refresher.
    #[must_use]
    pub fn entries(&self) -> Vec<ReplicaRef> {
        self.entries.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::types::NodeId;

    #[test]
    fn set_get_unset_cycle() {
        let cache = LeaderCache::new();
        let group = GroupName::new("orders");
        assert_eq!(cache.get(&group), None);

        cache.set(ReplicaRef::new(group.clone(), NodeId::new("a")));
        assert_eq!(
            cache.get(&group),
            Some(ReplicaRef::new(group.clone(), NodeId::new("a")))
        );

        cache.unset(&group);
        assert_eq!(cache.get(&group), None);
    }

    #[test]
    fn last_writer_wins() {
        let cache = LeaderCache::new();
        let group = GroupName::new("orders");
        cache.set(ReplicaRef::new(group.clone(), NodeId::new("a")));
        cache.set(ReplicaRef::new(group.clone(), NodeId::new("b")));
        assert_eq!(
            cache.get(&group).map(|r| r.node),
            Some(NodeId::new("b"))
        );
    }
}
