//! The public fleet node.
//!
//! `FleetNode` wires the manager, purge controller, and cache refresher over
//! a transport and a consensus engine, runs their loops as supervised tasks,
//! and exposes the fleet API. Every pass runs as its own task, so an error
//! or a panic inside one pass is isolated: the loop stays alive and retries
//! with jittered exponential backoff.

use crate::cache::LeaderCache;
use crate::config::{CallOptions, FleetConfig};
use crate::engine::ConsensusEngine;
use crate::error::{ClusterError, ClusterResult};
use crate::manager::Manager;
use crate::net::{RpcService, Transport};
use crate::purge::PurgeController;
use crate::refresh::CacheRefresher;
use crate::resolve::{ClusterClient, LeaderResolver};
use crate::service::NodeService;
use armada_core::placement::NodesPerZone;
use armada_core::types::{GroupName, NodeId, ReplicaRef, RvConfig, ZoneId};
use bytes::Bytes;
use rand::Rng;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One node of the fleet.
pub struct FleetNode {
    node: NodeId,
    manager: Arc<Manager>,
    resolver: Arc<LeaderResolver>,
    service: Arc<NodeService>,
    shutdown: watch::Sender<bool>,
}

impl FleetNode {
    /// Start a fleet node over a transport and an engine.
    ///
    /// The caller owns the inbound wiring: register [`FleetNode::rpc_service`]
    /// with whatever carries this node's traffic before activating.
    pub fn start(
        node: NodeId,
        config: FleetConfig,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn ConsensusEngine>,
    ) -> ClusterResult<Self> {
        config.validate()?;

        let cache = Arc::new(LeaderCache::new());
        let resolver = Arc::new(LeaderResolver::new(Arc::clone(&transport), cache));
        let client = |resolver: &Arc<LeaderResolver>| {
            ClusterClient::new(Arc::clone(resolver), config.internal_call)
        };

        let manager = Arc::new(Manager::new(
            node.clone(),
            config.clone(),
            Arc::clone(&engine),
            Arc::clone(&transport),
            client(&resolver),
        ));
        let service = Arc::new(NodeService::new(
            node.clone(),
            Arc::clone(&engine),
            Arc::clone(&manager),
        ));
        let purge = PurgeController::new(
            config.clone(),
            Arc::clone(&engine),
            Arc::clone(&transport),
            client(&resolver),
        );
        let refresher = CacheRefresher::new(config.clone(), Arc::clone(&transport), client(&resolver));

        let (shutdown, _) = watch::channel(false);
        {
            let manager = Arc::clone(&manager);
            spawn_loop(
                "balancing",
                config.balancing_interval,
                shutdown.subscribe(),
                move || {
                    let manager = Arc::clone(&manager);
                    async move { manager.rebalance().await }
                },
            );
        }
        {
            let purge = Arc::new(purge);
            spawn_loop(
                "node-purge",
                config.node_purge_reconnect_interval,
                shutdown.subscribe(),
                move || {
                    let purge = Arc::clone(&purge);
                    async move { purge.run_once().await }
                },
            );
        }
        {
            let refresher = Arc::new(refresher);
            spawn_loop(
                "cache-refresh",
                config.leader_cache_refresh_interval,
                shutdown.subscribe(),
                move || {
                    let refresher = Arc::clone(&refresher);
                    async move { refresher.run_once().await }
                },
            );
        }

        tracing::info!(node = %node, "fleet node started");
        Ok(Self {
            node,
            manager,
            resolver,
            service,
            shutdown,
        })
    }

    /// This node's identifier.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Inbound handler to register with the node's transport.
    pub fn rpc_service(&self) -> Arc<dyn RpcService> {
        Arc::clone(&self.service) as Arc<dyn RpcService>
    }

    /// Join this node to a zone.
    pub async fn activate(&self, zone: ZoneId) -> ClusterResult<()> {
        self.manager.activate(zone).await
    }

    /// Withdraw this node from its zone.
    pub async fn deactivate(&self) -> ClusterResult<()> {
        self.manager.deactivate().await
    }

    /// The zone map of active nodes.
    pub async fn active_nodes(&self) -> ClusterResult<NodesPerZone> {
        self.manager.active_nodes().await
    }

    /// Registered groups and their replica counts.
    pub async fn consensus_groups(&self) -> ClusterResult<BTreeMap<GroupName, u8>> {
        self.manager.consensus_groups().await
    }

    /// Register a consensus group and bootstrap its first replica.
    pub async fn add_consensus_group(
        &self,
        name: GroupName,
        n_replica: u8,
        rv_config: RvConfig,
    ) -> ClusterResult<()> {
        self.manager
            .add_consensus_group(name, n_replica, rv_config)
            .await
    }

    /// Unregister a consensus group.
    pub async fn remove_consensus_group(&self, name: &GroupName) -> ClusterResult<()> {
        self.manager.remove_consensus_group(name).await
    }

    /// Submit a command to a group's replicated value.
    pub async fn command(
        &self,
        name: &GroupName,
        arg: Bytes,
        options: CallOptions,
    ) -> ClusterResult<Bytes> {
        self.resolver.command(name, arg, &options).await
    }

    /// Run a linearizable query against a group's replicated value.
    pub async fn query(
        &self,
        name: &GroupName,
        arg: Bytes,
        options: CallOptions,
    ) -> ClusterResult<Bytes> {
        self.resolver.query(name, arg, &options).await
    }

    /// Last known leader of a group.
    pub async fn whereis_leader(&self, name: &GroupName) -> ClusterResult<Option<NodeId>> {
        self.manager.whereis_leader(name).await
    }

    /// Groups whose replicas this node currently runs.
    pub fn local_replicas(&self) -> Vec<ReplicaRef> {
        self.manager.local_replicas()
    }

    /// Force one reconciliation pass outside the periodic tick.
    pub async fn rebalance(&self) -> ClusterResult<()> {
        self.manager.rebalance().await
    }

    /// Stop the periodic loops.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        tracing::info!(node = %self.node, "fleet node shut down");
    }
}

impl Drop for FleetNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ClusterResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            let delay = if failures == 0 {
                interval
            } else {
                backoff_delay(interval, failures)
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            // Each pass gets its own task so a panic unwinds only that pass
            // and lands here as a join error.
            let outcome = match tokio::spawn(tick()).await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => Err(ClusterError::Engine(format!(
                    "pass panicked: {join_error}"
                ))),
                Err(join_error) => Err(ClusterError::Engine(format!(
                    "pass aborted: {join_error}"
                ))),
            };
            match outcome {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(task = name, error = %e, consecutive = failures,
                        "periodic task failed");
                }
            }
        }
        tracing::debug!(task = name, "periodic task stopped");
    });
}

fn backoff_delay(interval: Duration, failures: u32) -> Duration {
    let base = Duration::from_millis(250).saturating_mul(2u32.saturating_pow(failures.min(6)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
    base.min(interval).saturating_add(jitter)
}
