//! Opportunistic leader-cache refresh.
//!
//! Correctness never depends on this loop; it just shortens the window in
//! which a cached handle points at a demoted leader.

use crate::command::cluster_group;
use crate::config::FleetConfig;
use crate::net::{RpcRequest, RpcResponse, Transport};
use crate::resolve::ClusterClient;
use crate::state::{ClusterQuery, QueryReply};
use armada_core::types::ReplicaRef;
use std::sync::Arc;

/// Periodic re-resolution of every cached leader.
pub struct CacheRefresher {
    config: FleetConfig,
    transport: Arc<dyn Transport>,
    client: ClusterClient,
}

impl CacheRefresher {
    /// Create the refresher for one node.
    pub fn new(config: FleetConfig, transport: Arc<dyn Transport>, client: ClusterClient) -> Self {
        Self {
            config,
            transport,
            client,
        }
    }

    /// One refresh pass over the cache.
    pub async fn run_once(&self) -> crate::error::ClusterResult<()> {
        let cache = Arc::clone(self.client.resolver().cache());
        for cached in cache.entries() {
            if cached.group == cluster_group() {
                // The cluster group has no hint to consult; re-probe the
                // cached node directly.
                let request = RpcRequest::WhoIsLeader {
                    group: cached.group.clone(),
                };
                let probe = self
                    .transport
                    .call(&cached.node, request, self.config.internal_call.timeout)
                    .await;
                if !matches!(probe, Ok(RpcResponse::Leader(Some(_)))) {
                    cache.unset(&cached.group);
                }
                continue;
            }
            match self
                .client
                .fetch(&ClusterQuery::LeaderHint {
                    name: cached.group.clone(),
                })
                .await
            {
                Ok(QueryReply::LeaderHint(Some(node))) => {
                    if node != cached.node {
                        tracing::debug!(group = %cached.group, node = %node,
                            "leader cache entry refreshed");
                        cache.set(ReplicaRef::new(cached.group.clone(), node));
                    }
                }
                Ok(QueryReply::LeaderHint(None)) => cache.unset(&cached.group),
                Ok(_) | Err(_) => {}
            }
        }
        Ok(())
    }
}
