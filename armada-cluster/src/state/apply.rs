//! Command application logic.

use crate::command::ClusterCommand;
use armada_core::types::{GroupName, NodeId, RvConfig, ZoneId};
use serde::{Deserialize, Serialize};

use super::state::{ClusterState, GroupInfo, NodeFailure};

/// Reply to an applied command.
///
/// Rejections are data, not errors: the command committed and every replica
/// reached the same verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// The command took effect (or was an accepted no-op).
    Applied,
    /// The group is already registered and not tombstoned.
    AlreadyAdded,
    /// The group is not registered.
    NotFound,
    /// The command bytes did not decode.
    Malformed,
}

/// Apply a command to the cluster state.
pub fn apply_command(state: &mut ClusterState, cmd: ClusterCommand) -> CommandOutcome {
    match cmd {
        ClusterCommand::Activate { node, zone } => apply_activate(state, node, zone),
        ClusterCommand::Deactivate { node } => apply_deactivate(state, &node),
        ClusterCommand::AddGroup {
            name,
            n_replica,
            rv_config,
            leader_hint,
        } => apply_add_group(state, name, n_replica, rv_config, leader_hint),
        ClusterCommand::RemoveGroup {
            name,
            removed_at_ms,
        } => apply_remove_group(state, name, removed_at_ms),
        ClusterCommand::ReportMemberUp { name, node } => apply_member_up(state, &name, node),
        ClusterCommand::ReportMemberDown { name, node } => apply_member_down(state, &name, &node),
        ClusterCommand::ReportLeader { name, node } => apply_leader(state, &name, node),
        ClusterCommand::RecordNodeFailure {
            node,
            failing_group_count,
            observed_at_ms,
        } => apply_node_failure(state, node, failing_group_count, observed_at_ms),
        ClusterCommand::PurgeNode { node } => apply_purge_node(state, &node),
        ClusterCommand::ExpireTombstones { now_ms, ttl_ms } => {
            apply_expire_tombstones(state, now_ms, ttl_ms)
        }
    }
}

fn apply_activate(state: &mut ClusterState, node: NodeId, zone: ZoneId) -> CommandOutcome {
    state.drop_from_zones(&node);
    state.nodes_per_zone.entry(zone).or_default().insert(node);
    CommandOutcome::Applied
}

fn apply_deactivate(state: &mut ClusterState, node: &NodeId) -> CommandOutcome {
    state.drop_from_zones(node);
    state.node_failures.remove(node);
    CommandOutcome::Applied
}

fn apply_add_group(
    state: &mut ClusterState,
    name: GroupName,
    n_replica: u8,
    rv_config: RvConfig,
    leader_hint: Option<NodeId>,
) -> CommandOutcome {
    if state.groups.contains_key(&name) {
        return CommandOutcome::AlreadyAdded;
    }
    state.recently_removed.remove(&name);
    state.groups.insert(
        name,
        GroupInfo {
            n_replica,
            rv_config,
            leader_node: leader_hint,
            members: Default::default(),
        },
    );
    CommandOutcome::Applied
}

fn apply_remove_group(
    state: &mut ClusterState,
    name: GroupName,
    removed_at_ms: u64,
) -> CommandOutcome {
    if state.groups.remove(&name).is_none() {
        return CommandOutcome::NotFound;
    }
    state.recently_removed.insert(name, removed_at_ms);
    CommandOutcome::Applied
}

fn apply_member_up(state: &mut ClusterState, name: &GroupName, node: NodeId) -> CommandOutcome {
    // Stale reports about unknown groups are ignored, not rejected.
    if let Some(group) = state.groups.get_mut(name) {
        if group.members.contains(&node) || group.members.len() < usize::from(group.n_replica) {
            group.members.insert(node);
        }
    }
    CommandOutcome::Applied
}

fn apply_member_down(state: &mut ClusterState, name: &GroupName, node: &NodeId) -> CommandOutcome {
    if let Some(group) = state.groups.get_mut(name) {
        group.members.remove(node);
        if group.leader_node.as_ref() == Some(node) {
            group.leader_node = None;
        }
    }
    CommandOutcome::Applied
}

fn apply_leader(state: &mut ClusterState, name: &GroupName, node: NodeId) -> CommandOutcome {
    if let Some(group) = state.groups.get_mut(name) {
        if group.members.contains(&node) {
            group.leader_node = Some(node);
        }
    }
    CommandOutcome::Applied
}

fn apply_node_failure(
    state: &mut ClusterState,
    node: NodeId,
    failing_group_count: u32,
    observed_at_ms: u64,
) -> CommandOutcome {
    if failing_group_count == 0 {
        state.node_failures.remove(&node);
        return CommandOutcome::Applied;
    }
    state
        .node_failures
        .entry(node)
        .and_modify(|record| record.failing_group_count = failing_group_count)
        .or_insert(NodeFailure {
            first_failure_at_ms: observed_at_ms,
            failing_group_count,
        });
    CommandOutcome::Applied
}

fn apply_purge_node(state: &mut ClusterState, node: &NodeId) -> CommandOutcome {
    state.drop_from_zones(node);
    for group in state.groups.values_mut() {
        group.members.remove(node);
        if group.leader_node.as_ref() == Some(node) {
            group.leader_node = None;
        }
    }
    state.node_failures.remove(node);
    CommandOutcome::Applied
}

fn apply_expire_tombstones(state: &mut ClusterState, now_ms: u64, ttl_ms: u64) -> CommandOutcome {
    state
        .recently_removed
        .retain(|_, removed_at| now_ms.saturating_sub(*removed_at) < ttl_ms);
    CommandOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    fn group(name: &str) -> GroupName {
        GroupName::new(name)
    }

    fn populated_state() -> ClusterState {
        let mut state = ClusterState::default();
        for (n, z) in [("a", "1"), ("b", "2"), ("c", "3")] {
            apply_command(
                &mut state,
                ClusterCommand::Activate {
                    node: node(n),
                    zone: ZoneId::new(z),
                },
            );
        }
        apply_command(
            &mut state,
            ClusterCommand::AddGroup {
                name: group("orders"),
                n_replica: 3,
                rv_config: RvConfig::default(),
                leader_hint: None,
            },
        );
        state
    }

    fn assert_consistent(state: &ClusterState) {
        let mut seen = std::collections::BTreeSet::new();
        for nodes in state.nodes_per_zone.values() {
            for n in nodes {
                assert!(seen.insert(n.clone()), "{n} appears in two zones");
            }
        }
        for (name, info) in &state.groups {
            assert!(
                info.members.len() <= usize::from(info.n_replica),
                "{name} has more members than replicas"
            );
            if let Some(leader) = &info.leader_node {
                assert!(info.members.contains(leader), "{name} leader not a member");
            }
            assert!(
                !state.recently_removed.contains_key(name),
                "{name} is both registered and tombstoned"
            );
        }
    }

    #[test]
    fn activate_moves_node_between_zones() {
        let mut state = populated_state();
        let outcome = apply_command(
            &mut state,
            ClusterCommand::Activate {
                node: node("a"),
                zone: ZoneId::new("2"),
            },
        );
        assert_eq!(outcome, CommandOutcome::Applied);
        assert_eq!(state.zone_of(&node("a")), Some(&ZoneId::new("2")));
        assert!(!state.nodes_per_zone.contains_key(&ZoneId::new("1")));
        assert_consistent(&state);
    }

    #[test]
    fn activate_is_idempotent() {
        let mut state = populated_state();
        let before = state.clone();
        apply_command(
            &mut state,
            ClusterCommand::Activate {
                node: node("a"),
                zone: ZoneId::new("1"),
            },
        );
        assert_eq!(state, before);
    }

    #[test]
    fn deactivate_leaves_member_sets_alone() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::ReportMemberUp {
                name: group("orders"),
                node: node("a"),
            },
        );
        apply_command(&mut state, ClusterCommand::Deactivate { node: node("a") });
        assert!(!state.is_active(&node("a")));
        assert!(state.groups[&group("orders")].members.contains(&node("a")));
    }

    #[test]
    fn duplicate_add_is_rejected_without_changes() {
        let mut state = populated_state();
        let before = state.clone();
        let outcome = apply_command(
            &mut state,
            ClusterCommand::AddGroup {
                name: group("orders"),
                n_replica: 5,
                rv_config: RvConfig::default(),
                leader_hint: None,
            },
        );
        assert_eq!(outcome, CommandOutcome::AlreadyAdded);
        assert_eq!(state, before);
    }

    #[test]
    fn add_consumes_tombstone() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::RemoveGroup {
                name: group("orders"),
                removed_at_ms: 1_000,
            },
        );
        assert!(state.recently_removed.contains_key(&group("orders")));

        let outcome = apply_command(
            &mut state,
            ClusterCommand::AddGroup {
                name: group("orders"),
                n_replica: 3,
                rv_config: RvConfig::default(),
                leader_hint: None,
            },
        );
        assert_eq!(outcome, CommandOutcome::Applied);
        assert!(!state.recently_removed.contains_key(&group("orders")));
        assert_consistent(&state);
    }

    #[test]
    fn remove_unknown_group_reports_not_found() {
        let mut state = populated_state();
        let outcome = apply_command(
            &mut state,
            ClusterCommand::RemoveGroup {
                name: group("nope"),
                removed_at_ms: 1_000,
            },
        );
        assert_eq!(outcome, CommandOutcome::NotFound);
    }

    #[test]
    fn member_up_caps_at_replica_count() {
        let mut state = populated_state();
        for n in ["a", "b", "c"] {
            apply_command(
                &mut state,
                ClusterCommand::ReportMemberUp {
                    name: group("orders"),
                    node: node(n),
                },
            );
        }
        apply_command(
            &mut state,
            ClusterCommand::Activate {
                node: node("d"),
                zone: ZoneId::new("1"),
            },
        );
        let outcome = apply_command(
            &mut state,
            ClusterCommand::ReportMemberUp {
                name: group("orders"),
                node: node("d"),
            },
        );
        assert_eq!(outcome, CommandOutcome::Applied);
        assert_eq!(state.groups[&group("orders")].members.len(), 3);
        assert!(!state.groups[&group("orders")].members.contains(&node("d")));
        assert_consistent(&state);
    }

    #[test]
    fn member_down_clears_leadership() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::ReportMemberUp {
                name: group("orders"),
                node: node("a"),
            },
        );
        apply_command(
            &mut state,
            ClusterCommand::ReportLeader {
                name: group("orders"),
                node: node("a"),
            },
        );
        assert_eq!(
            state.groups[&group("orders")].leader_node,
            Some(node("a"))
        );

        apply_command(
            &mut state,
            ClusterCommand::ReportMemberDown {
                name: group("orders"),
                node: node("a"),
            },
        );
        assert_eq!(state.groups[&group("orders")].leader_node, None);
        assert_consistent(&state);
    }

    #[test]
    fn leader_report_for_non_member_is_ignored() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::ReportLeader {
                name: group("orders"),
                node: node("a"),
            },
        );
        assert_eq!(state.groups[&group("orders")].leader_node, None);
    }

    #[test]
    fn failure_record_keeps_first_timestamp() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::RecordNodeFailure {
                node: node("a"),
                failing_group_count: 3,
                observed_at_ms: 1_000,
            },
        );
        apply_command(
            &mut state,
            ClusterCommand::RecordNodeFailure {
                node: node("a"),
                failing_group_count: 5,
                observed_at_ms: 2_000,
            },
        );
        let record = state.node_failures[&node("a")];
        assert_eq!(record.first_failure_at_ms, 1_000);
        assert_eq!(record.failing_group_count, 5);

        apply_command(
            &mut state,
            ClusterCommand::RecordNodeFailure {
                node: node("a"),
                failing_group_count: 0,
                observed_at_ms: 3_000,
            },
        );
        assert!(!state.node_failures.contains_key(&node("a")));
    }

    #[test]
    fn purge_erases_every_trace_of_the_node() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::ReportMemberUp {
                name: group("orders"),
                node: node("a"),
            },
        );
        apply_command(
            &mut state,
            ClusterCommand::ReportLeader {
                name: group("orders"),
                node: node("a"),
            },
        );
        apply_command(
            &mut state,
            ClusterCommand::RecordNodeFailure {
                node: node("a"),
                failing_group_count: 1,
                observed_at_ms: 1_000,
            },
        );

        apply_command(&mut state, ClusterCommand::PurgeNode { node: node("a") });
        assert!(!state.is_active(&node("a")));
        assert!(!state.groups[&group("orders")].members.contains(&node("a")));
        assert_eq!(state.groups[&group("orders")].leader_node, None);
        assert!(!state.node_failures.contains_key(&node("a")));
        assert_consistent(&state);
    }

    #[test]
    fn tombstones_age_out() {
        let mut state = populated_state();
        apply_command(
            &mut state,
            ClusterCommand::RemoveGroup {
                name: group("orders"),
                removed_at_ms: 1_000,
            },
        );
        apply_command(
            &mut state,
            ClusterCommand::ExpireTombstones {
                now_ms: 1_500,
                ttl_ms: 1_000,
            },
        );
        assert!(state.recently_removed.contains_key(&group("orders")));

        apply_command(
            &mut state,
            ClusterCommand::ExpireTombstones {
                now_ms: 2_500,
                ttl_ms: 1_000,
            },
        );
        assert!(state.recently_removed.is_empty());
    }

    #[test]
    fn replayed_commands_reach_the_same_state() {
        // Idempotency backstop for at-most-once delivery: applying the same
        // report twice must match applying it once.
        let mut once = populated_state();
        let mut twice = populated_state();
        let up = ClusterCommand::ReportMemberUp {
            name: group("orders"),
            node: node("b"),
        };
        apply_command(&mut once, up.clone());
        apply_command(&mut twice, up.clone());
        apply_command(&mut twice, up);
        assert_eq!(once, twice);
    }
}
