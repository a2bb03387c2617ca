//! Common test utilities for armada-cluster tests.

use armada_cluster::engine::{EngineBoard, InProcessEngine};
use armada_cluster::net::LocalFabric;
use armada_cluster::{FleetConfig, FleetNode};
use armada_core::types::{NodeId, ZoneId};
use std::sync::Arc;

/// A single-process fleet: N nodes over one fabric and one engine board.
pub struct TestFleet {
    /// The shared message fabric, for partition injection.
    pub fabric: LocalFabric,
    /// The fleet nodes, in creation order ("a", "b", "c", ...).
    pub nodes: Vec<FleetNode>,
}

#[allow(dead_code)]
impl TestFleet {
    /// Build a fleet of `count` nodes with the test timing profile.
    pub fn new(count: usize) -> Self {
        Self::with_config(count, FleetConfig::test_profile())
    }

    /// Build a fleet of `count` nodes with a custom configuration.
    pub fn with_config(count: usize, config: FleetConfig) -> Self {
        let fabric = LocalFabric::new();
        let board = EngineBoard::new();
        let mut nodes = Vec::with_capacity(count);

        for i in 0..count {
            let id = NodeId::new(node_name(i));
            let engine = Arc::new(InProcessEngine::new(
                id.clone(),
                board.clone(),
                fabric.clone(),
            ));
            let transport = Arc::new(fabric.handle(id.clone()));
            let node = FleetNode::start(id.clone(), config.clone(), transport, engine)
                .expect("node should start");
            fabric.register(id, node.rpc_service());
            nodes.push(node);
        }

        Self { fabric, nodes }
    }

    /// Activate node `i` into zone `zones[i % zones.len()]`.
    pub async fn activate_zones(&self, zones: &[&str]) {
        for (i, node) in self.nodes.iter().enumerate() {
            node.activate(ZoneId::new(zones[i % zones.len()]))
                .await
                .expect("activation should succeed");
        }
    }

    /// Run explicit reconciliation passes on every node.
    ///
    /// The periodic loops would converge on their own; driving the passes by
    /// hand keeps tests deterministic.
    pub async fn settle(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in &self.nodes {
                let _ = node.rebalance().await;
            }
        }
    }

    /// The node id used for index `i`.
    pub fn id(&self, i: usize) -> NodeId {
        NodeId::new(node_name(i))
    }
}

fn node_name(i: usize) -> String {
    // Single letters keep failover order predictable: the in-process engine
    // falls over to the lowest connected member.
    char::from(b'a' + (i as u8 % 26)).to_string()
}
