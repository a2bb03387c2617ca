//! Per-node coordinator.
//!
//! The manager owns this node's side of the fleet: its activation state, the
//! registry of replicas it actually runs, and the periodic reconciliation
//! that moves the local process set toward the placements recorded in the
//! cluster state. It also carries the add-group bootstrap handshake and the
//! health probe the purge controller calls.

use crate::command::{cluster_group, ClusterCommand, CLUSTER_GROUP};
use crate::config::FleetConfig;
use crate::engine::{ConsensusEngine, ReplicaRole, ReplicaSpec, StartMode};
use crate::error::{ClusterError, ClusterResult, RpcError, RpcResult};
use crate::net::{AddGroupOutcome, RpcRequest, RpcResponse, Transport};
use crate::resolve::ClusterClient;
use crate::state::{ClusterMachine, ClusterQuery, CommandOutcome, OpaqueMachine, QueryReply};
use armada_core::placement::{lrw_members, NodesPerZone};
use armada_core::types::{GroupName, NodeId, ReplicaRef, RvConfig, ZoneId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, for timestamps carried in commands.
pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Replica count of the cluster group for a given active-node count:
/// capped at seven, rounded down to odd.
fn cluster_replica_count(active: usize) -> usize {
    let capped = active.min(7);
    if capped > 1 && capped % 2 == 0 {
        capped - 1
    } else {
        capped
    }
}

/// Per-node fleet coordinator.
pub struct Manager {
    node: NodeId,
    config: FleetConfig,
    engine: Arc<dyn ConsensusEngine>,
    transport: Arc<dyn Transport>,
    client: ClusterClient,
    zone: RwLock<Option<ZoneId>>,
    replicas: RwLock<HashMap<GroupName, ReplicaRef>>,
}

impl Manager {
    /// Create the coordinator for one node.
    pub fn new(
        node: NodeId,
        config: FleetConfig,
        engine: Arc<dyn ConsensusEngine>,
        transport: Arc<dyn Transport>,
        client: ClusterClient,
    ) -> Self {
        Self {
            node,
            config,
            engine,
            transport,
            client,
            zone: RwLock::new(None),
            replicas: RwLock::new(HashMap::new()),
        }
    }

    /// The node this manager coordinates.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Zone this node is activated into, if any.
    pub fn zone(&self) -> Option<ZoneId> {
        self.zone.read().clone()
    }

    /// Groups whose replicas this node currently runs.
    pub fn local_replicas(&self) -> Vec<ReplicaRef> {
        self.replicas.read().values().cloned().collect()
    }

    fn group_dir(&self, name: &GroupName) -> Option<PathBuf> {
        self.config
            .persistence_dir_parent
            .as_ref()
            .map(|parent| parent.join(name.as_str()))
    }

    fn bootstrap_timeout(&self) -> Duration {
        self.config.internal_call.timeout * 8
    }

    /// Join this node to a zone.
    ///
    /// The first node of a fresh cluster finds no cluster group to talk to
    /// and bootstraps it locally before retrying the activation command.
    pub async fn activate(&self, zone: ZoneId) -> ClusterResult<()> {
        if self.zone.read().is_some() {
            return Err(ClusterError::NotInactive);
        }
        let cmd = ClusterCommand::Activate {
            node: self.node.clone(),
            zone: zone.clone(),
        };
        match self.client.submit(&cmd).await {
            Ok(_) => {}
            Err(ClusterError::NoLeader { .. }) => {
                self.bootstrap_cluster_group().await?;
                self.client.submit(&cmd).await?;
            }
            Err(e) => return Err(e),
        }
        *self.zone.write() = Some(zone.clone());
        tracing::info!(node = %self.node, zone = %zone, "node activated");
        Ok(())
    }

    /// Withdraw this node from its zone.
    ///
    /// Member sets are not rewritten here; the reconciliation ticks of every
    /// manager drain the node's replicas afterwards.
    pub async fn deactivate(&self) -> ClusterResult<()> {
        if self.zone.read().is_none() {
            return Err(ClusterError::Inactive);
        }
        self.client
            .submit(&ClusterCommand::Deactivate {
                node: self.node.clone(),
            })
            .await?;
        *self.zone.write() = None;
        tracing::info!(node = %self.node, "node deactivated");
        Ok(())
    }

    async fn bootstrap_cluster_group(&self) -> ClusterResult<()> {
        let spec = ReplicaSpec {
            group: cluster_group(),
            rv_config: RvConfig::default(),
            persistence_dir: self.group_dir(&cluster_group()),
            mode: StartMode::Bootstrap,
            machine: Box::new(ClusterMachine::new()),
        };
        match self.engine.start_replica(spec).await {
            Ok(replica) => {
                self.replicas.write().insert(cluster_group(), replica);
                tracing::info!(node = %self.node, "cluster group bootstrapped");
                Ok(())
            }
            // Lost the bootstrap race; the group exists somewhere else.
            Err(ClusterError::ProcessExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The zone map of active nodes.
    pub async fn active_nodes(&self) -> ClusterResult<NodesPerZone> {
        match self.client.fetch(&ClusterQuery::ActiveNodes).await? {
            QueryReply::ActiveNodes(zones) => Ok(zones),
            other => Err(unexpected_reply("active nodes", &other)),
        }
    }

    /// Registered groups and their replica counts.
    pub async fn consensus_groups(&self) -> ClusterResult<BTreeMap<GroupName, u8>> {
        match self.client.fetch(&ClusterQuery::ConsensusGroups).await? {
            QueryReply::ConsensusGroups(groups) => Ok(groups),
            other => Err(unexpected_reply("consensus groups", &other)),
        }
    }

    /// Last known leader of a group.
    pub async fn whereis_leader(&self, name: &GroupName) -> ClusterResult<Option<NodeId>> {
        if *name == cluster_group() {
            let found = self
                .client
                .resolver()
                .discover(name, self.config.internal_call.timeout)
                .await;
            return Ok(found.map(|handle| handle.node));
        }
        match self
            .client
            .fetch(&ClusterQuery::LeaderHint { name: name.clone() })
            .await?
        {
            QueryReply::LeaderHint(hint) => Ok(hint),
            other => Err(unexpected_reply("leader hint", &other)),
        }
    }

    /// Register a group and bootstrap its first replica.
    ///
    /// When the bootstrap handshake fails after the registration committed,
    /// the registration is rolled back before the error surfaces.
    pub async fn add_consensus_group(
        &self,
        name: GroupName,
        n_replica: u8,
        rv_config: RvConfig,
    ) -> ClusterResult<()> {
        if n_replica == 0 {
            return Err(ClusterError::Config(
                "n_replica must be at least 1".to_string(),
            ));
        }
        let leader_hint = self
            .client
            .resolver()
            .cache()
            .get(&cluster_group())
            .map(|handle| handle.node);
        let outcome = self
            .client
            .submit(&ClusterCommand::AddGroup {
                name: name.clone(),
                n_replica,
                rv_config,
                leader_hint,
            })
            .await?;
        match outcome {
            CommandOutcome::Applied => {}
            CommandOutcome::AlreadyAdded => return Err(ClusterError::AlreadyAdded(name)),
            other => return Err(unexpected_outcome("group registration", other)),
        }

        let leader = match self.client.resolver().cache().get(&cluster_group()) {
            Some(handle) => handle,
            None => self
                .client
                .resolver()
                .discover(&cluster_group(), self.config.internal_call.timeout)
                .await
                .ok_or_else(|| ClusterError::NoLeader {
                    group: cluster_group(),
                })?,
        };
        let request = RpcRequest::AwaitAddGroup { name: name.clone() };
        match self
            .transport
            .call(&leader.node, request, self.bootstrap_timeout())
            .await
        {
            Ok(RpcResponse::AddGroup(AddGroupOutcome::LeaderStarted)) => {
                tracing::info!(group = %name, node = %leader.node, "first replica started");
                Ok(())
            }
            Ok(RpcResponse::AddGroup(AddGroupOutcome::LeaderDelegatedTo(node))) => {
                tracing::info!(group = %name, node = %node, "first replica delegated");
                Ok(())
            }
            Ok(RpcResponse::AddGroup(AddGroupOutcome::ProcessExists)) => {
                self.rollback_add(&name).await;
                Err(ClusterError::ProcessExists {
                    group: name,
                    node: leader.node,
                })
            }
            Ok(other) => {
                self.rollback_add(&name).await;
                Err(ClusterError::Engine(format!(
                    "unexpected bootstrap reply: {other:?}"
                )))
            }
            Err(e) => {
                self.rollback_add(&name).await;
                Err(ClusterError::Engine(e.to_string()))
            }
        }
    }

    async fn rollback_add(&self, name: &GroupName) {
        let cmd = ClusterCommand::RemoveGroup {
            name: name.clone(),
            removed_at_ms: unix_now_ms(),
        };
        if let Err(e) = self.client.submit(&cmd).await {
            tracing::warn!(group = %name, error = %e,
                "rollback of failed group add did not commit");
        }
    }

    /// Unregister a group; replicas drain on the next reconciliation ticks.
    pub async fn remove_consensus_group(&self, name: &GroupName) -> ClusterResult<()> {
        let outcome = self
            .client
            .submit(&ClusterCommand::RemoveGroup {
                name: name.clone(),
                removed_at_ms: unix_now_ms(),
            })
            .await?;
        match outcome {
            CommandOutcome::Applied => Ok(()),
            CommandOutcome::NotFound => Err(ClusterError::NotFound(name.clone())),
            other => Err(unexpected_outcome("group removal", other)),
        }
    }

    /// One reconciliation pass: diff local replicas against the placements
    /// derived from the replicated state, then start and stop accordingly.
    pub async fn rebalance(&self) -> ClusterResult<()> {
        if self.zone.read().is_none() && self.replicas.read().is_empty() {
            return Ok(());
        }
        let zones = self.active_nodes().await?;
        let total_active = zones.values().map(|nodes| nodes.len()).sum::<usize>();
        self.reconcile_cluster_group(&zones, total_active).await?;

        let registered = self.consensus_groups().await?;
        for (name, n_replica) in &registered {
            if let Err(e) = self.reconcile_group(name, *n_replica, total_active).await {
                tracing::warn!(group = %name, error = %e, "group reconciliation failed");
            }
        }
        self.prune_removed_groups(&registered).await;
        self.expire_tombstones_if_leader().await;
        Ok(())
    }

    async fn reconcile_cluster_group(
        &self,
        zones: &NodesPerZone,
        total_active: usize,
    ) -> ClusterResult<()> {
        if total_active == 0 {
            return Ok(());
        }
        let wanted = cluster_replica_count(total_active);
        let desired = lrw_members(zones, CLUSTER_GROUP, wanted);
        let hosts = self.replicas.read().contains_key(&cluster_group());
        let should_host = desired.contains(&self.node);

        if should_host && !hosts {
            let spec = ReplicaSpec {
                group: cluster_group(),
                rv_config: RvConfig::default(),
                persistence_dir: self.group_dir(&cluster_group()),
                mode: StartMode::Join,
                machine: Box::new(ClusterMachine::new()),
            };
            match self.engine.start_replica(spec).await {
                Ok(replica) => {
                    self.replicas.write().insert(cluster_group(), replica);
                    tracing::info!(node = %self.node, "joined the cluster group");
                }
                Err(ClusterError::ProcessExists { .. }) => {
                    self.replicas
                        .write()
                        .insert(cluster_group(), ReplicaRef::new(cluster_group(), self.node.clone()));
                }
                // The cluster group vanished between the query and this tick;
                // activation owns its bootstrap.
                Err(ClusterError::Engine(reason)) => {
                    tracing::debug!(reason = %reason, "cluster group join deferred");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        } else if !should_host && hosts && total_active >= wanted {
            self.engine.stop_replica(&cluster_group()).await?;
            self.replicas.write().remove(&cluster_group());
            tracing::info!(node = %self.node, "left the cluster group");
        }
        Ok(())
    }

    async fn reconcile_group(
        &self,
        name: &GroupName,
        n_replica: u8,
        total_active: usize,
    ) -> ClusterResult<()> {
        let view = match self
            .client
            .fetch(&ClusterQuery::Group { name: name.clone() })
            .await?
        {
            QueryReply::Group(Some(view)) => view,
            // Removed between the listing and this fetch.
            QueryReply::Group(None) => return Ok(()),
            other => return Err(unexpected_reply("group view", &other)),
        };
        let desired = match self
            .client
            .fetch(&ClusterQuery::DesiredPlacement { name: name.clone() })
            .await?
        {
            QueryReply::DesiredPlacement(Some(placement)) => placement,
            QueryReply::DesiredPlacement(None) => return Ok(()),
            other => return Err(unexpected_reply("desired placement", &other)),
        };

        let hosts = self.replicas.read().contains_key(name);
        let should_host = desired.contains(&self.node);

        if should_host {
            if !hosts {
                let spec = ReplicaSpec {
                    group: name.clone(),
                    rv_config: view.rv_config.clone(),
                    persistence_dir: self.group_dir(name),
                    mode: StartMode::Join,
                    machine: Box::new(OpaqueMachine::new()),
                };
                match self.engine.start_replica(spec).await {
                    Ok(replica) => {
                        self.replicas.write().insert(name.clone(), replica);
                        tracing::info!(group = %name, node = %self.node, "replica started");
                    }
                    // The registry lost track of a replica that is still running.
                    Err(ClusterError::ProcessExists { .. }) => {
                        self.replicas
                            .write()
                            .insert(name.clone(), ReplicaRef::new(name.clone(), self.node.clone()));
                    }
                    // Nothing to join yet: the first replica belongs to the
                    // add-group handshake, not to this tick.
                    Err(ClusterError::Engine(reason)) => {
                        tracing::debug!(group = %name, reason = %reason, "replica join deferred");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            // Re-asserted every tick: an earlier report may have been capped
            // out while a departing member still held the slot.
            if !view.members.contains(&self.node) {
                self.client
                    .submit(&ClusterCommand::ReportMemberUp {
                        name: name.clone(),
                        node: self.node.clone(),
                    })
                    .await?;
            }
        } else if hosts {
            // Only shrink once the leader-confirmed placement excludes this
            // node and enough live nodes remain to hold the full replica set.
            if total_active >= usize::from(n_replica) {
                self.engine.stop_replica(name).await?;
                self.replicas.write().remove(name);
                self.client
                    .submit(&ClusterCommand::ReportMemberDown {
                        name: name.clone(),
                        node: self.node.clone(),
                    })
                    .await?;
                tracing::info!(group = %name, node = %self.node, "replica stopped");
            }
        } else if view.members.contains(&self.node) {
            // Membership row with no local process behind it.
            self.client
                .submit(&ClusterCommand::ReportMemberDown {
                    name: name.clone(),
                    node: self.node.clone(),
                })
                .await?;
        }

        if let Some(status) = self.engine.status(name).await {
            if status.role == ReplicaRole::Leader && view.leader_node.as_ref() != Some(&self.node)
            {
                self.client
                    .submit(&ClusterCommand::ReportLeader {
                        name: name.clone(),
                        node: self.node.clone(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn prune_removed_groups(&self, registered: &BTreeMap<GroupName, u8>) {
        let stale: Vec<GroupName> = self
            .replicas
            .read()
            .keys()
            .filter(|group| **group != cluster_group() && !registered.contains_key(*group))
            .cloned()
            .collect();
        for name in stale {
            if let Err(e) = self.engine.stop_replica(&name).await {
                tracing::warn!(group = %name, error = %e, "failed to stop removed group");
                continue;
            }
            self.replicas.write().remove(&name);
            tracing::info!(group = %name, node = %self.node, "stopped replica of removed group");
        }
    }

    async fn expire_tombstones_if_leader(&self) {
        let Some(status) = self.engine.status(&cluster_group()).await else {
            return;
        };
        if status.role != ReplicaRole::Leader {
            return;
        }
        let cmd = ClusterCommand::ExpireTombstones {
            now_ms: unix_now_ms(),
            ttl_ms: self.config.tombstone_ttl.as_millis() as u64,
        };
        if let Err(e) = self.client.submit(&cmd).await {
            tracing::debug!(error = %e, "tombstone expiry skipped");
        }
    }

    /// Finish bootstrapping a freshly added group (runs on the cluster-group
    /// leader): start the first replica on the placement head, delegating
    /// when that head is another node.
    pub async fn complete_adding_group(&self, name: &GroupName) -> RpcResult<AddGroupOutcome> {
        let leads = matches!(
            self.engine.status(&cluster_group()).await,
            Some(status) if status.role == ReplicaRole::Leader
        );
        if !leads {
            return Err(RpcError::NotLeader {
                group: cluster_group(),
                node: self.node.clone(),
                hint: None,
            });
        }
        let desired = match self
            .client
            .fetch(&ClusterQuery::DesiredPlacement { name: name.clone() })
            .await
        {
            Ok(QueryReply::DesiredPlacement(Some(placement))) => placement,
            Ok(_) => return Err(RpcError::transport(&self.node, "group is not registered")),
            Err(e) => return Err(RpcError::transport(&self.node, e.to_string())),
        };
        let head = desired.first().cloned().unwrap_or_else(|| self.node.clone());
        if head == self.node {
            return self.start_initial_replica(name).await;
        }
        let request = RpcRequest::StartInitialReplica { name: name.clone() };
        match self
            .transport
            .call(&head, request, self.bootstrap_timeout())
            .await?
        {
            RpcResponse::AddGroup(AddGroupOutcome::LeaderStarted) => {
                Ok(AddGroupOutcome::LeaderDelegatedTo(head))
            }
            RpcResponse::AddGroup(outcome) => Ok(outcome),
            other => Err(RpcError::transport(
                &head,
                format!("unexpected delegation reply: {other:?}"),
            )),
        }
    }

    /// Start the first replica of a new group on this node and record its
    /// membership and leadership in the cluster state.
    pub async fn start_initial_replica(&self, name: &GroupName) -> RpcResult<AddGroupOutcome> {
        let view = match self
            .client
            .fetch(&ClusterQuery::Group { name: name.clone() })
            .await
        {
            Ok(QueryReply::Group(Some(view))) => view,
            Ok(_) => return Err(RpcError::transport(&self.node, "group is not registered")),
            Err(e) => return Err(RpcError::transport(&self.node, e.to_string())),
        };
        let spec = ReplicaSpec {
            group: name.clone(),
            rv_config: view.rv_config,
            persistence_dir: self.group_dir(name),
            mode: StartMode::Bootstrap,
            machine: Box::new(OpaqueMachine::new()),
        };
        match self.engine.start_replica(spec).await {
            Ok(replica) => {
                self.replicas.write().insert(name.clone(), replica);
                for cmd in [
                    ClusterCommand::ReportMemberUp {
                        name: name.clone(),
                        node: self.node.clone(),
                    },
                    ClusterCommand::ReportLeader {
                        name: name.clone(),
                        node: self.node.clone(),
                    },
                ] {
                    if let Err(e) = self.client.submit(&cmd).await {
                        tracing::warn!(group = %name, error = %e,
                            "bootstrap report did not commit");
                    }
                }
                tracing::info!(group = %name, node = %self.node, "first replica started");
                Ok(AddGroupOutcome::LeaderStarted)
            }
            Err(ClusterError::ProcessExists { .. }) => Ok(AddGroupOutcome::ProcessExists),
            Err(e) => Err(RpcError::transport(&self.node, e.to_string())),
        }
    }

    /// Health-probe the replicas this node hosts; returns (failing, total).
    pub async fn probe_local_replicas(&self) -> (u32, u32) {
        let groups: Vec<GroupName> = self.replicas.read().keys().cloned().collect();
        let total = groups.len() as u32;
        let mut failing = 0;
        for group in groups {
            if self.engine.status(&group).await.is_none() {
                failing += 1;
            }
        }
        (failing, total)
    }
}

fn unexpected_reply(context: &str, reply: &QueryReply) -> ClusterError {
    ClusterError::Codec(format!("unexpected {context} reply: {reply:?}"))
}

fn unexpected_outcome(context: &str, outcome: CommandOutcome) -> ClusterError {
    ClusterError::Engine(format!("unexpected {context} outcome: {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_replica_count_stays_odd_and_capped() {
        assert_eq!(cluster_replica_count(1), 1);
        assert_eq!(cluster_replica_count(2), 1);
        assert_eq!(cluster_replica_count(3), 3);
        assert_eq!(cluster_replica_count(4), 3);
        assert_eq!(cluster_replica_count(5), 5);
        assert_eq!(cluster_replica_count(8), 7);
        assert_eq!(cluster_replica_count(20), 7);
    }
}
