//! In-process fabric connecting the nodes of a single-process cluster.
//!
//! Each node gets a [`FabricHandle`] for outbound calls and registers its
//! [`RpcService`] for inbound ones. Connectivity is a property of the fabric,
//! so tests can partition a node away and reconnect it later; a disconnected
//! node can neither be reached nor reach anyone.

use crate::error::{RpcError, RpcResult};
use crate::net::transport::{RpcRequest, RpcResponse, RpcService, Transport};
use armada_core::types::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FabricState {
    handlers: HashMap<NodeId, Arc<dyn RpcService>>,
    disconnected: HashSet<NodeId>,
}

/// Shared in-process message fabric.
#[derive(Clone, Default)]
pub struct LocalFabric {
    state: Arc<RwLock<FabricState>>,
}

impl LocalFabric {
    /// Create an empty fabric.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's inbound handler.
    pub fn register(&self, node: NodeId, service: Arc<dyn RpcService>) {
        self.state.write().handlers.insert(node, service);
    }

    /// Remove a node from the fabric entirely.
    pub fn deregister(&self, node: &NodeId) {
        let mut state = self.state.write();
        state.handlers.remove(node);
        state.disconnected.remove(node);
    }

    /// Cut a node off from every peer.
    pub fn disconnect(&self, node: &NodeId) {
        self.state.write().disconnected.insert(node.clone());
    }

    /// Restore a previously disconnected node.
    pub fn reconnect(&self, node: &NodeId) {
        self.state.write().disconnected.remove(node);
    }

    /// Whether the node is registered and not partitioned away.
    #[must_use]
    pub fn is_connected(&self, node: &NodeId) -> bool {
        let state = self.state.read();
        state.handlers.contains_key(node) && !state.disconnected.contains(node)
    }

    /// Per-node transport handle.
    #[must_use]
    pub fn handle(&self, node: NodeId) -> FabricHandle {
        FabricHandle {
            node,
            fabric: self.clone(),
        }
    }

    fn reachable_handler(
        &self,
        from: &NodeId,
        target: &NodeId,
    ) -> RpcResult<Arc<dyn RpcService>> {
        let state = self.state.read();
        if state.disconnected.contains(from) {
            return Err(RpcError::transport(target, "local node is disconnected"));
        }
        if state.disconnected.contains(target) {
            return Err(RpcError::transport(target, "target node is disconnected"));
        }
        state
            .handlers
            .get(target)
            .cloned()
            .ok_or_else(|| RpcError::transport(target, "unknown node"))
    }
}

/// One node's view of the fabric.
#[derive(Clone)]
pub struct FabricHandle {
    node: NodeId,
    fabric: LocalFabric,
}

#[async_trait]
impl Transport for FabricHandle {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn known_nodes(&self) -> Vec<NodeId> {
        let state = self.fabric.state.read();
        let mut nodes: Vec<NodeId> = state.handlers.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    async fn call(
        &self,
        target: &NodeId,
        request: RpcRequest,
        timeout: Duration,
    ) -> RpcResult<RpcResponse> {
        let handler = self.fabric.reachable_handler(&self.node, target)?;
        match tokio::time::timeout(timeout, handler.handle(request)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::transport(target, "deadline exceeded")),
        }
    }

    async fn ping(&self, target: &NodeId) -> bool {
        self.fabric.is_connected(&self.node) && self.fabric.is_connected(target)
    }
}
