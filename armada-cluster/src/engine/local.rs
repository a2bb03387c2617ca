//! In-process consensus engine.
//!
//! All replicas of a group share one applier guarded by a mutex, which gives
//! single-process clusters the same observable semantics as a distributed
//! engine: linearized commands, leader-only dispatch, deterministic failover
//! to the lowest connected member, and at-most-once application keyed by the
//! command reference. Connectivity comes from the fabric, so partitioning a
//! node in a test demotes its replicas the same way a crashed VM would.

use crate::engine::{
    ConsensusEngine, ReplicaRole, ReplicaSpec, ReplicaStatus, StartMode, StateMachine,
};
use crate::error::{ClusterError, ClusterResult, RpcError, RpcResult};
use crate::net::LocalFabric;
use armada_core::types::{CommandRef, GroupName, NodeId, ReplicaRef};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SNAPSHOT_FILE: &str = "snapshot";
const DEDUP_CAPACITY: usize = 1024;

struct GroupCore {
    machine: Box<dyn StateMachine>,
    members: BTreeSet<NodeId>,
    leader: Option<NodeId>,
    last_applied: u64,
    dedup: HashMap<CommandRef, Bytes>,
    dedup_order: VecDeque<CommandRef>,
    persistence_dir: Option<PathBuf>,
}

impl GroupCore {
    /// Settle on a leader among connected members, preferring the incumbent.
    fn refresh_leader(&mut self, alive: impl Fn(&NodeId) -> bool) -> Option<NodeId> {
        if let Some(leader) = &self.leader {
            if self.members.contains(leader) && alive(leader) {
                return Some(leader.clone());
            }
        }
        let next = self.members.iter().find(|n| alive(n)).cloned();
        self.leader = next.clone();
        next
    }

    fn remember_reply(&mut self, reference: CommandRef, reply: Bytes) {
        self.dedup.insert(reference, reply);
        self.dedup_order.push_back(reference);
        while self.dedup_order.len() > DEDUP_CAPACITY {
            if let Some(oldest) = self.dedup_order.pop_front() {
                self.dedup.remove(&oldest);
            }
        }
    }

    fn persist(&self, group: &GroupName) {
        if let Some(dir) = &self.persistence_dir {
            if let Err(e) = write_snapshot(dir, &self.machine.snapshot()) {
                tracing::warn!(group = %group, error = %e, "snapshot write failed");
            }
        }
    }
}

fn write_snapshot(dir: &Path, snapshot: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(SNAPSHOT_FILE), snapshot)
}

fn read_snapshot(dir: &Path) -> Option<Vec<u8>> {
    std::fs::read(dir.join(SNAPSHOT_FILE)).ok()
}

/// Shared substrate holding the groups of an in-process cluster.
///
/// Every node's [`InProcessEngine`] is built over the same board.
#[derive(Clone, Default)]
pub struct EngineBoard {
    groups: Arc<Mutex<HashMap<GroupName, Arc<Mutex<GroupCore>>>>>,
}

impl EngineBoard {
    /// Create an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, group: &GroupName) -> Option<Arc<Mutex<GroupCore>>> {
        self.groups.lock().get(group).cloned()
    }
}

/// One node's view of the in-process engine.
pub struct InProcessEngine {
    node: NodeId,
    board: EngineBoard,
    fabric: LocalFabric,
}

impl InProcessEngine {
    /// Create the engine for one node over a shared board and fabric.
    #[must_use]
    pub fn new(node: NodeId, board: EngineBoard, fabric: LocalFabric) -> Self {
        Self {
            node,
            board,
            fabric,
        }
    }

    fn alive(&self) -> impl Fn(&NodeId) -> bool + '_ {
        |node| self.fabric.is_connected(node)
    }

    fn leader_checked(&self, group: &GroupName) -> RpcResult<Arc<Mutex<GroupCore>>> {
        let core = self
            .board
            .get(group)
            .ok_or_else(|| RpcError::transport(&self.node, "no replica of the group here"))?;
        {
            let mut locked = core.lock();
            if !locked.members.contains(&self.node) {
                return Err(RpcError::transport(&self.node, "no replica of the group here"));
            }
            let leader = locked.refresh_leader(self.alive());
            if leader.as_ref() != Some(&self.node) {
                return Err(RpcError::NotLeader {
                    group: group.clone(),
                    node: self.node.clone(),
                    hint: leader,
                });
            }
        }
        Ok(core)
    }
}

#[async_trait]
impl ConsensusEngine for InProcessEngine {
    async fn start_replica(&self, spec: ReplicaSpec) -> ClusterResult<ReplicaRef> {
        let mut groups = self.board.groups.lock();
        if let Some(core) = groups.get(&spec.group) {
            if spec.mode == StartMode::Bootstrap {
                return Err(ClusterError::ProcessExists {
                    group: spec.group,
                    node: self.node.clone(),
                });
            }
            let mut locked = core.lock();
            if !locked.members.insert(self.node.clone()) {
                return Err(ClusterError::ProcessExists {
                    group: spec.group,
                    node: self.node.clone(),
                });
            }
            tracing::debug!(group = %spec.group, node = %self.node, "replica joined group");
            return Ok(ReplicaRef::new(spec.group, self.node.clone()));
        }

        if spec.mode == StartMode::Join {
            return Err(ClusterError::Engine(format!(
                "group {} has no replica to join yet",
                spec.group
            )));
        }

        let mut machine = spec.machine;
        if let Some(dir) = &spec.persistence_dir {
            if let Some(snapshot) = read_snapshot(dir) {
                tracing::info!(group = %spec.group, "restoring replica from snapshot");
                machine.restore(&snapshot);
            }
        }
        let core = GroupCore {
            machine,
            members: BTreeSet::from([self.node.clone()]),
            leader: Some(self.node.clone()),
            last_applied: 0,
            dedup: HashMap::new(),
            dedup_order: VecDeque::new(),
            persistence_dir: spec.persistence_dir,
        };
        groups.insert(spec.group.clone(), Arc::new(Mutex::new(core)));
        tracing::debug!(group = %spec.group, node = %self.node, "replica bootstrapped group");
        Ok(ReplicaRef::new(spec.group, self.node.clone()))
    }

    async fn stop_replica(&self, group: &GroupName) -> ClusterResult<()> {
        let mut groups = self.board.groups.lock();
        let Some(core) = groups.get(group) else {
            return Ok(());
        };
        let now_empty = {
            let mut locked = core.lock();
            if !locked.members.remove(&self.node) {
                return Ok(());
            }
            if locked.leader.as_ref() == Some(&self.node) {
                locked.leader = None;
            }
            locked.persist(group);
            locked.members.is_empty()
        };
        if now_empty {
            groups.remove(group);
        }
        tracing::debug!(group = %group, node = %self.node, "replica stopped");
        Ok(())
    }

    async fn command(
        &self,
        group: &GroupName,
        arg: Bytes,
        _timeout: Duration,
        reference: CommandRef,
    ) -> RpcResult<Bytes> {
        let core = self.leader_checked(group)?;
        let mut locked = core.lock();
        if let Some(reply) = locked.dedup.get(&reference) {
            return Ok(reply.clone());
        }
        let reply = locked.machine.apply(&arg);
        locked.last_applied += 1;
        locked.remember_reply(reference, reply.clone());
        locked.persist(group);
        Ok(reply)
    }

    async fn query(&self, group: &GroupName, arg: Bytes, _timeout: Duration) -> RpcResult<Bytes> {
        let core = self.leader_checked(group)?;
        let locked = core.lock();
        Ok(locked.machine.query(&arg))
    }

    async fn status(&self, group: &GroupName) -> Option<ReplicaStatus> {
        let core = self.board.get(group)?;
        let mut locked = core.lock();
        if !locked.members.contains(&self.node) {
            return None;
        }
        let leader = locked.refresh_leader(self.alive());
        let role = if leader.as_ref() == Some(&self.node) {
            ReplicaRole::Leader
        } else {
            ReplicaRole::Follower
        };
        Some(ReplicaStatus {
            role,
            last_applied: locked.last_applied,
        })
    }
}
