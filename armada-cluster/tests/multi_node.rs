//! Multi-node fleet tests.
//!
//! Three-or-more node fleets in one process: placement spread, leader
//! failover inside the retry budget, and unhealthy-node purge.

mod common;

use armada_cluster::{CallOptions, ClusterError};
use armada_core::types::{GroupName, NodeId, RvConfig, ZoneId};
use bytes::Bytes;
use common::TestFleet;
use std::collections::BTreeSet;
use std::time::Duration;

fn call_options() -> CallOptions {
    CallOptions {
        timeout: Duration::from_millis(200),
        retry: 5,
        retry_interval: Duration::from_millis(25),
    }
}

fn hosts_of(fleet: &TestFleet, name: &GroupName) -> BTreeSet<NodeId> {
    fleet
        .nodes
        .iter()
        .filter(|node| {
            node.local_replicas()
                .iter()
                .any(|replica| replica.group == *name)
        })
        .map(|node| node.node().clone())
        .collect()
}

#[tokio::test]
async fn every_zone_hosts_one_replica() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[0]
        .add_consensus_group(name.clone(), 3, RvConfig::default())
        .await
        .expect("add group");
    fleet.settle(3).await;

    let hosts = hosts_of(&fleet, &name);
    assert_eq!(hosts.len(), 3, "all three zones should host a replica");
}

#[tokio::test]
async fn placement_respects_the_replica_count_and_spreads_zones() {
    let fleet = TestFleet::new(4);
    fleet.activate_zones(&["1", "2"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[1]
        .add_consensus_group(name.clone(), 2, RvConfig::default())
        .await
        .expect("add group");
    fleet.settle(3).await;

    let hosts = hosts_of(&fleet, &name);
    assert_eq!(hosts.len(), 2, "exactly n_replica nodes should host");

    let zones = fleet.nodes[0].active_nodes().await.expect("zones");
    let host_zones: BTreeSet<ZoneId> = hosts
        .iter()
        .map(|host| {
            zones
                .iter()
                .find(|(_, nodes)| nodes.contains(host))
                .map(|(zone, _)| zone.clone())
                .expect("host is active")
        })
        .collect();
    assert_eq!(host_zones.len(), 2, "replicas should spread across zones");
}

#[tokio::test]
async fn all_nodes_agree_on_the_active_zone_map() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let reference = fleet.nodes[0].active_nodes().await.expect("zones");
    for node in &fleet.nodes[1..] {
        assert_eq!(node.active_nodes().await.expect("zones"), reference);
    }
}

#[tokio::test]
async fn commands_survive_a_leader_failure() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[0]
        .add_consensus_group(name.clone(), 3, RvConfig::default())
        .await
        .expect("add group");
    fleet.settle(3).await;

    let leader = fleet.nodes[0]
        .whereis_leader(&name)
        .await
        .expect("lookup")
        .expect("group has a leader");
    fleet.nodes[0]
        .command(&name, Bytes::from_static(b"before"), call_options())
        .await
        .expect("command against the healthy fleet");

    fleet.fabric.disconnect(&leader);
    let survivor = fleet
        .nodes
        .iter()
        .find(|node| *node.node() != leader)
        .expect("two nodes remain");

    let previous = survivor
        .command(&name, Bytes::from_static(b"after"), call_options())
        .await
        .expect("command should fail over within the retry budget");
    assert_eq!(previous, Bytes::from_static(b"before"));

    fleet.settle(2).await;
    let reported = survivor
        .whereis_leader(&name)
        .await
        .expect("lookup after failover");
    assert_ne!(reported, Some(leader));
}

#[tokio::test]
async fn disconnected_nodes_are_purged_and_replicas_reassigned() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[0]
        .add_consensus_group(name.clone(), 3, RvConfig::default())
        .await
        .expect("add group");
    fleet.settle(3).await;

    let lost = fleet.id(2);
    fleet.fabric.disconnect(&lost);

    // The purge controller needs a few probe rounds plus the failure window.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    fleet.settle(3).await;

    let zones = fleet.nodes[0].active_nodes().await.expect("zones");
    assert!(
        zones.values().all(|nodes| !nodes.contains(&lost)),
        "the unreachable node should be purged from every zone"
    );

    let hosts = hosts_of(&fleet, &name);
    assert!(hosts.contains(&fleet.id(0)));
    assert!(hosts.contains(&fleet.id(1)));
    assert!(
        fleet.nodes[0]
            .command(&name, Bytes::from_static(b"post-purge"), call_options())
            .await
            .is_ok(),
        "the group should keep accepting commands after the purge"
    );
}

#[tokio::test]
async fn groups_can_be_added_through_any_node() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[2]
        .add_consensus_group(name.clone(), 2, RvConfig::default())
        .await
        .expect("add through a follower");

    for node in &fleet.nodes {
        let groups = node.consensus_groups().await.expect("groups");
        assert_eq!(groups.get(&name), Some(&2));
    }
}

#[tokio::test]
async fn duplicate_add_races_resolve_to_one_registration() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[0]
        .add_consensus_group(name.clone(), 3, RvConfig::default())
        .await
        .expect("first add");
    let second = fleet.nodes[1]
        .add_consensus_group(name.clone(), 3, RvConfig::default())
        .await;
    assert!(matches!(second, Err(ClusterError::AlreadyAdded(_))));
}

#[tokio::test]
async fn deactivated_nodes_drain_their_replicas() {
    let fleet = TestFleet::new(3);
    fleet.activate_zones(&["1", "2", "3"]).await;

    let name = GroupName::new("orders");
    fleet.nodes[0]
        .add_consensus_group(name.clone(), 2, RvConfig::default())
        .await
        .expect("add group");
    fleet.settle(3).await;

    let hosts = hosts_of(&fleet, &name);
    let leaving = hosts.iter().next().expect("group has hosts").clone();
    let leaving_node = fleet
        .nodes
        .iter()
        .find(|node| *node.node() == leaving)
        .expect("host is in the fleet");

    leaving_node.deactivate().await.expect("deactivate");
    fleet.settle(4).await;

    let hosts = hosts_of(&fleet, &name);
    assert!(
        !hosts.contains(&leaving),
        "a deactivated node should hand its replicas off"
    );
    assert_eq!(hosts.len(), 2, "the replica count should be restored");
}
