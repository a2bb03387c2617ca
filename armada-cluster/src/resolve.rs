//! Leader resolution and the bounded-retry dispatch protocol.
//!
//! A dispatch first trusts the leader cache, then falls back to discovery:
//! ask the cluster group for its last leader hint and verify it, or broadcast
//! a who-is-leader probe when no hint helps. Transport faults and leadership
//! rejections evict the cache entry and burn one retry; rejections carried
//! inside a committed reply are terminal and surface unchanged.

use crate::cache::LeaderCache;
use crate::command::{cluster_group, ClusterCommand};
use crate::config::CallOptions;
use crate::error::{ClusterError, ClusterResult, RpcError, RpcResult};
use crate::net::{RpcRequest, RpcResponse, Transport};
use crate::state::{ClusterQuery, CommandOutcome, QueryReply};
use armada_core::types::{CommandRef, GroupName, NodeId, ReplicaRef};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

enum GroupOp {
    Command { arg: Bytes, reference: CommandRef },
    Query { arg: Bytes },
}

/// Client-side dispatcher routing commands and queries to group leaders.
pub struct LeaderResolver {
    transport: Arc<dyn Transport>,
    cache: Arc<LeaderCache>,
}

impl LeaderResolver {
    /// Create a resolver over a transport and a shared cache.
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<LeaderCache>) -> Self {
        Self { transport, cache }
    }

    /// The shared leader cache.
    pub fn cache(&self) -> &Arc<LeaderCache> {
        &self.cache
    }

    /// Submit a command to a group's leader.
    ///
    /// One idempotency reference covers every attempt, so a command that
    /// committed before its reply got lost is not applied twice.
    pub async fn command(
        &self,
        group: &GroupName,
        arg: Bytes,
        options: &CallOptions,
    ) -> ClusterResult<Bytes> {
        let op = GroupOp::Command {
            arg,
            reference: CommandRef::new(),
        };
        self.call_with_retry(group, &op, options).await
    }

    /// Run a linearizable query on a group's leader.
    pub async fn query(
        &self,
        group: &GroupName,
        arg: Bytes,
        options: &CallOptions,
    ) -> ClusterResult<Bytes> {
        let op = GroupOp::Query { arg };
        self.call_with_retry(group, &op, options).await
    }

    async fn call_with_retry(
        &self,
        group: &GroupName,
        op: &GroupOp,
        options: &CallOptions,
    ) -> ClusterResult<Bytes> {
        let mut tries_left = options.retry + 1;
        loop {
            if tries_left == 0 {
                return Err(ClusterError::NoLeader {
                    group: group.clone(),
                });
            }
            let handle = match self.cache.get(group) {
                Some(handle) => handle,
                None => match self.discover(group, options.timeout).await {
                    Some(handle) => handle,
                    None => {
                        tokio::time::sleep(options.retry_interval).await;
                        tries_left -= 1;
                        continue;
                    }
                },
            };
            match self.try_rpc(&handle, op, options.timeout).await {
                Ok(reply) => return Ok(reply),
                Err(error) => {
                    tracing::debug!(group = %group, node = %handle.node, error = %error,
                        "dispatch attempt failed");
                    self.cache.unset(group);
                    if let RpcError::NotLeader {
                        hint: Some(leader), ..
                    } = &error
                    {
                        self.cache
                            .set(ReplicaRef::new(group.clone(), leader.clone()));
                    }
                    tokio::time::sleep(options.retry_interval).await;
                    tries_left -= 1;
                }
            }
        }
    }

    async fn try_rpc(
        &self,
        handle: &ReplicaRef,
        op: &GroupOp,
        timeout: Duration,
    ) -> RpcResult<Bytes> {
        let request = match op {
            GroupOp::Command { arg, reference } => RpcRequest::GroupCommand {
                group: handle.group.clone(),
                arg: arg.clone(),
                reference: *reference,
                timeout_ms: timeout.as_millis() as u64,
            },
            GroupOp::Query { arg } => RpcRequest::GroupQuery {
                group: handle.group.clone(),
                arg: arg.clone(),
                timeout_ms: timeout.as_millis() as u64,
            },
        };
        match self.transport.call(&handle.node, request, timeout).await? {
            RpcResponse::Group(reply) => Ok(reply),
            other => Err(RpcError::transport(
                &handle.node,
                format!("unexpected reply to group dispatch: {other:?}"),
            )),
        }
    }

    /// One discovery pass. Failure returns `None` and costs the caller a
    /// retry; success has already updated the cache.
    pub async fn discover(&self, group: &GroupName, timeout: Duration) -> Option<ReplicaRef> {
        let cluster = cluster_group();
        if *group != cluster {
            if let Some(node) = self.cluster_leader_hint(group, timeout).await {
                if let Some(handle) = self.probe(&node, group, timeout).await {
                    self.cache.set(handle.clone());
                    return Some(handle);
                }
            }
        }
        for node in self.transport.known_nodes() {
            if let Some(handle) = self.probe(&node, group, timeout).await {
                tracing::debug!(group = %group, leader = %handle.node, "leader found by probe");
                self.cache.set(handle.clone());
                return Some(handle);
            }
        }
        None
    }

    /// Ask one node whether it leads the group.
    async fn probe(&self, node: &NodeId, group: &GroupName, timeout: Duration) -> Option<ReplicaRef> {
        let request = RpcRequest::WhoIsLeader {
            group: group.clone(),
        };
        match self.transport.call(node, request, timeout).await {
            Ok(RpcResponse::Leader(answer)) => answer,
            _ => None,
        }
    }

    /// Fetch the cluster group's recorded leader hint for a user group.
    ///
    /// A single attempt against the cached (or probed) cluster leader; the
    /// surrounding retry loop absorbs failures.
    async fn cluster_leader_hint(&self, group: &GroupName, timeout: Duration) -> Option<NodeId> {
        let cluster = cluster_group();
        let handle = match self.cache.get(&cluster) {
            Some(handle) => handle,
            None => {
                let mut found = None;
                for node in self.transport.known_nodes() {
                    if let Some(handle) = self.probe(&node, &cluster, timeout).await {
                        found = Some(handle);
                        break;
                    }
                }
                let handle = found?;
                self.cache.set(handle.clone());
                handle
            }
        };
        let arg = serde_json::to_vec(&ClusterQuery::LeaderHint {
            name: group.clone(),
        })
        .ok()?;
        let op = GroupOp::Query {
            arg: Bytes::from(arg),
        };
        match self.try_rpc(&handle, &op, timeout).await {
            Ok(reply) => match serde_json::from_slice(&reply) {
                Ok(QueryReply::LeaderHint(hint)) => hint,
                _ => None,
            },
            Err(_) => {
                self.cache.unset(&cluster);
                None
            }
        }
    }
}

/// Typed client for the cluster group itself.
pub struct ClusterClient {
    resolver: Arc<LeaderResolver>,
    options: CallOptions,
}

impl ClusterClient {
    /// Create a client with fixed dispatch options.
    pub fn new(resolver: Arc<LeaderResolver>, options: CallOptions) -> Self {
        Self { resolver, options }
    }

    /// The underlying resolver.
    pub fn resolver(&self) -> &Arc<LeaderResolver> {
        &self.resolver
    }

    /// Dispatch options this client uses.
    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    /// Submit a cluster command and decode its outcome.
    pub async fn submit(&self, command: &ClusterCommand) -> ClusterResult<CommandOutcome> {
        let arg = serde_json::to_vec(command)?;
        let reply = self
            .resolver
            .command(&cluster_group(), Bytes::from(arg), &self.options)
            .await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Run a cluster query and decode its reply.
    pub async fn fetch(&self, query: &ClusterQuery) -> ClusterResult<QueryReply> {
        let arg = serde_json::to_vec(query)?;
        let reply = self
            .resolver
            .query(&cluster_group(), Bytes::from(arg), &self.options)
            .await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        local: NodeId,
        attempts: AtomicU32,
        fail_first: u32,
        leader: NodeId,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn local_node(&self) -> &NodeId {
            &self.local
        }

        fn known_nodes(&self) -> Vec<NodeId> {
            vec![self.leader.clone()]
        }

        async fn call(
            &self,
            target: &NodeId,
            request: RpcRequest,
            _timeout: Duration,
        ) -> RpcResult<RpcResponse> {
            match request {
                RpcRequest::WhoIsLeader { group } => Ok(RpcResponse::Leader(Some(
                    ReplicaRef::new(group, self.leader.clone()),
                ))),
                RpcRequest::GroupCommand { .. } => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt < self.fail_first {
                        Err(RpcError::transport(target, "injected fault"))
                    } else {
                        Ok(RpcResponse::Group(Bytes::from_static(b"\"ok\"")))
                    }
                }
                // Hint lookups against the cluster group answer with a payload
                // the caller cannot decode as a hint, forcing the probe path.
                RpcRequest::GroupQuery { .. } => {
                    Ok(RpcResponse::Group(Bytes::from_static(b"\"ok\"")))
                }
                _ => Err(RpcError::transport(target, "unexpected request")),
            }
        }

        async fn ping(&self, _target: &NodeId) -> bool {
            true
        }
    }

    fn options() -> CallOptions {
        CallOptions {
            timeout: Duration::from_millis(50),
            retry: 3,
            retry_interval: Duration::from_millis(5),
        }
    }

    fn resolver(transport: FlakyTransport) -> LeaderResolver {
        LeaderResolver::new(Arc::new(transport), Arc::new(LeaderCache::new()))
    }

    #[tokio::test]
    async fn retries_recover_from_transient_faults() {
        let resolver = resolver(FlakyTransport {
            local: NodeId::new("client"),
            attempts: AtomicU32::new(0),
            fail_first: 2,
            leader: NodeId::new("a"),
        });
        let reply = resolver
            .command(&GroupName::new("g"), Bytes::new(), &options())
            .await
            .expect("retries should recover");
        assert_eq!(reply, Bytes::from_static(b"\"ok\""));
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_no_leader() {
        let resolver = resolver(FlakyTransport {
            local: NodeId::new("client"),
            attempts: AtomicU32::new(0),
            fail_first: u32::MAX,
            leader: NodeId::new("a"),
        });
        let result = resolver
            .command(&GroupName::new("g"), Bytes::new(), &options())
            .await;
        assert!(matches!(result, Err(ClusterError::NoLeader { .. })));
    }

    #[tokio::test]
    async fn attempts_stop_at_the_budget() {
        let transport = Arc::new(FlakyTransport {
            local: NodeId::new("client"),
            attempts: AtomicU32::new(0),
            fail_first: u32::MAX,
            leader: NodeId::new("a"),
        });
        let resolver = LeaderResolver::new(transport.clone(), Arc::new(LeaderCache::new()));
        let _ = resolver
            .command(&GroupName::new("g"), Bytes::new(), &options())
            .await;
        // retry + 1 dispatch attempts, each against a freshly discovered leader.
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn discovery_feeds_the_cache() {
        let resolver = resolver(FlakyTransport {
            local: NodeId::new("client"),
            attempts: AtomicU32::new(0),
            fail_first: 0,
            leader: NodeId::new("a"),
        });
        resolver
            .query(&GroupName::new("g"), Bytes::new(), &options())
            .await
            .expect("query");
        assert_eq!(
            resolver.cache().get(&GroupName::new("g")).map(|r| r.node),
            Some(NodeId::new("a"))
        );
    }
}
