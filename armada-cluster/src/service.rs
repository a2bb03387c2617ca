//! Inbound RPC handler of a fleet node.
//!
//! Peers reach a node's replicas and its manager through this service: group
//! dispatch, leader probes, the add-group bootstrap handshake, and health
//! probes.

use crate::engine::{ConsensusEngine, ReplicaRole};
use crate::error::RpcResult;
use crate::manager::Manager;
use crate::net::{RpcRequest, RpcResponse, RpcService};
use armada_core::types::{NodeId, ReplicaRef};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// RPC endpoint of one fleet node.
pub struct NodeService {
    node: NodeId,
    engine: Arc<dyn ConsensusEngine>,
    manager: Arc<Manager>,
}

impl NodeService {
    /// Create the endpoint over the node's engine and manager.
    pub fn new(node: NodeId, engine: Arc<dyn ConsensusEngine>, manager: Arc<Manager>) -> Self {
        Self {
            node,
            engine,
            manager,
        }
    }
}

#[async_trait]
impl RpcService for NodeService {
    async fn handle(&self, request: RpcRequest) -> RpcResult<RpcResponse> {
        match request {
            RpcRequest::GroupCommand {
                group,
                arg,
                reference,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(timeout_ms);
                self.engine
                    .command(&group, arg, timeout, reference)
                    .await
                    .map(RpcResponse::Group)
            }
            RpcRequest::GroupQuery {
                group,
                arg,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(timeout_ms);
                self.engine
                    .query(&group, arg, timeout)
                    .await
                    .map(RpcResponse::Group)
            }
            RpcRequest::WhoIsLeader { group } => {
                let answer = match self.engine.status(&group).await {
                    Some(status) if status.role == ReplicaRole::Leader => {
                        Some(ReplicaRef::new(group, self.node.clone()))
                    }
                    _ => None,
                };
                Ok(RpcResponse::Leader(answer))
            }
            RpcRequest::AwaitAddGroup { name } => self
                .manager
                .complete_adding_group(&name)
                .await
                .map(RpcResponse::AddGroup),
            RpcRequest::StartInitialReplica { name } => self
                .manager
                .start_initial_replica(&name)
                .await
                .map(RpcResponse::AddGroup),
            RpcRequest::ProbeReplicas => {
                let (failing, total) = self.manager.probe_local_replicas().await;
                Ok(RpcResponse::ProbeReport { failing, total })
            }
        }
    }
}
