//! Unhealthy-node detection and purge.
//!
//! Runs on the cluster-group leader. Each pass pings every active node
//! (which doubles as a reconnect attempt), counts failing replicas per node,
//! keeps the failure records current, and purges nodes that stayed unhealthy
//! for the whole configured window. Managers observe the purge through the
//! state diff and rebalance naturally.

use crate::command::{cluster_group, ClusterCommand};
use crate::config::FleetConfig;
use crate::engine::{ConsensusEngine, ReplicaRole};
use crate::manager::unix_now_ms;
use crate::net::{RpcRequest, RpcResponse, Transport};
use crate::resolve::ClusterClient;
use crate::state::{ClusterQuery, QueryReply};
use armada_core::types::{GroupName, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Leader-side health loop body.
pub struct PurgeController {
    config: FleetConfig,
    engine: Arc<dyn ConsensusEngine>,
    transport: Arc<dyn Transport>,
    client: ClusterClient,
}

impl PurgeController {
    /// Create the controller for one node.
    pub fn new(
        config: FleetConfig,
        engine: Arc<dyn ConsensusEngine>,
        transport: Arc<dyn Transport>,
        client: ClusterClient,
    ) -> Self {
        Self {
            config,
            engine,
            transport,
            client,
        }
    }

    /// One health pass; a no-op on every node but the cluster-group leader.
    pub async fn run_once(&self) -> crate::error::ClusterResult<()> {
        let leads = matches!(
            self.engine.status(&cluster_group()).await,
            Some(status) if status.role == ReplicaRole::Leader
        );
        if !leads {
            return Ok(());
        }

        let QueryReply::ActiveNodes(zones) = self.client.fetch(&ClusterQuery::ActiveNodes).await?
        else {
            return Ok(());
        };
        let QueryReply::ConsensusGroups(groups) =
            self.client.fetch(&ClusterQuery::ConsensusGroups).await?
        else {
            return Ok(());
        };
        let QueryReply::UnhealthyNodes(failures) =
            self.client.fetch(&ClusterQuery::UnhealthyNodes).await?
        else {
            return Ok(());
        };

        let memberships = self.membership_counts(&groups).await;
        let now_ms = unix_now_ms();
        let mut still_failing = BTreeSet::new();

        for node in zones.values().flatten() {
            let failing = self.failing_replicas(node, &memberships).await;
            if failing > self.config.node_purge_threshold_failing_members {
                still_failing.insert(node.clone());
                self.submit(ClusterCommand::RecordNodeFailure {
                    node: node.clone(),
                    failing_group_count: failing,
                    observed_at_ms: now_ms,
                })
                .await;
            } else if failures.contains_key(node) {
                self.submit(ClusterCommand::RecordNodeFailure {
                    node: node.clone(),
                    failing_group_count: 0,
                    observed_at_ms: now_ms,
                })
                .await;
            }
        }

        let window_ms = self.config.node_purge_failure_time_window.as_millis() as u64;
        for (node, record) in &failures {
            let active = zones.values().any(|nodes| nodes.contains(node));
            let expired = now_ms.saturating_sub(record.first_failure_at_ms) > window_ms;
            let purge = !active || (still_failing.contains(node) && expired);
            if purge {
                tracing::warn!(node = %node, "purging unhealthy node");
                self.submit(ClusterCommand::PurgeNode { node: node.clone() })
                    .await;
            }
        }
        Ok(())
    }

    /// Replicas each node is recorded as hosting.
    async fn membership_counts(&self, groups: &BTreeMap<GroupName, u8>) -> BTreeMap<NodeId, u32> {
        let mut counts = BTreeMap::new();
        for name in groups.keys() {
            let reply = self
                .client
                .fetch(&ClusterQuery::Group { name: name.clone() })
                .await;
            if let Ok(QueryReply::Group(Some(view))) = reply {
                for member in view.members {
                    *counts.entry(member).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Count a node's unresponsive replicas.
    ///
    /// An unreachable node counts every membership it holds; a reachable one
    /// is asked to probe its own replicas.
    async fn failing_replicas(&self, node: &NodeId, memberships: &BTreeMap<NodeId, u32>) -> u32 {
        let held = memberships.get(node).copied().unwrap_or(0);
        if !self.transport.ping(node).await {
            tracing::debug!(node = %node, "node unreachable during health probe");
            return held;
        }
        let probe = self
            .transport
            .call(
                node,
                RpcRequest::ProbeReplicas,
                self.config.internal_call.timeout,
            )
            .await;
        match probe {
            Ok(RpcResponse::ProbeReport { failing, .. }) => failing,
            _ => held,
        }
    }

    async fn submit(&self, cmd: ClusterCommand) {
        let name = cmd.name();
        if let Err(e) = self.client.submit(&cmd).await {
            tracing::warn!(command = name, error = %e, "health command did not commit");
        }
    }
}
