//! The transport seam and the RPC vocabulary spoken across it.

use crate::error::RpcResult;
use armada_core::types::{CommandRef, GroupName, NodeId, ReplicaRef};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Requests a node may receive from a peer.
///
/// Every request names its target through the (node, group) directory; the
/// deadline rides inside the payload so the receiving side can honor it too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Submit a command to the group's local replica.
    GroupCommand {
        /// Target group.
        group: GroupName,
        /// Opaque command payload.
        arg: Bytes,
        /// Idempotency reference.
        reference: CommandRef,
        /// Deadline for the submission.
        timeout_ms: u64,
    },

    /// Run a linearizable query on the group's local replica.
    GroupQuery {
        /// Target group.
        group: GroupName,
        /// Opaque query payload.
        arg: Bytes,
        /// Deadline for the query.
        timeout_ms: u64,
    },

    /// Ask whether the receiving node leads the group.
    WhoIsLeader {
        /// Group being resolved.
        group: GroupName,
    },

    /// Ask the cluster-group leader to finish bootstrapping a new group.
    AwaitAddGroup {
        /// Group being bootstrapped.
        name: GroupName,
    },

    /// Ask a specific node to start the first replica of a new group.
    StartInitialReplica {
        /// Group being bootstrapped.
        name: GroupName,
    },

    /// Ask a node to health-probe the replicas it hosts.
    ProbeReplicas,
}

/// Outcome of the add-group bootstrap handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddGroupOutcome {
    /// The cluster-group leader started the first replica itself.
    LeaderStarted,
    /// The leader delegated the first replica to another node.
    LeaderDelegatedTo(NodeId),
    /// A replica of the group already exists; the caller must roll back.
    ProcessExists,
}

/// Replies to [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Reply payload from a group's machine.
    Group(Bytes),
    /// Affirmative or negative answer to a leader probe.
    Leader(Option<ReplicaRef>),
    /// Reply to the bootstrap handshake.
    AddGroup(AddGroupOutcome),
    /// Health-probe report.
    ProbeReport {
        /// Replicas currently failing on the probed node.
        failing: u32,
        /// Replicas hosted by the probed node.
        total: u32,
    },
}

/// Outbound half: calls from this node to a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The node this handle speaks for.
    fn local_node(&self) -> &NodeId;

    /// Every node currently present in the directory.
    fn known_nodes(&self) -> Vec<NodeId>;

    /// Call a peer with a deadline.
    async fn call(
        &self,
        target: &NodeId,
        request: RpcRequest,
        timeout: Duration,
    ) -> RpcResult<RpcResponse>;

    /// Connectivity test, doubling as a reconnect attempt.
    async fn ping(&self, target: &NodeId) -> bool;
}

/// Inbound half: a node's handler for requests from peers.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Handle one request.
    async fn handle(&self, request: RpcRequest) -> RpcResult<RpcResponse>;
}
