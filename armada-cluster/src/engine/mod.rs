//! The consensus-engine seam.
//!
//! The fleet layer never runs Raft itself; it drives an engine through this
//! trait. Starting and stopping replicas, submitting commands and queries,
//! and reading replica status are the only operations the fleet assumes. The
//! crate ships [`InProcessEngine`] for single-process clusters and tests;
//! distributed engines implement the same trait out of tree.

mod local;

pub use local::{EngineBoard, InProcessEngine};

use crate::error::{ClusterResult, RpcResult};
use armada_core::types::{CommandRef, GroupName, ReplicaRef, RvConfig};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

/// A deterministic replicated machine.
///
/// The engine feeds committed commands to `apply` in log order on every
/// replica; identical inputs must produce identical replies and state on all
/// of them. `query` reads without mutating and is only served on the leader.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command, returning the reply payload.
    fn apply(&mut self, command: &[u8]) -> Bytes;

    /// Answer a read-only query.
    fn query(&self, arg: &[u8]) -> Bytes;

    /// Serialize the full state.
    fn snapshot(&self) -> Bytes;

    /// Replace the state from a snapshot.
    fn restore(&mut self, snapshot: &[u8]);
}

/// How a replica enters its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// First replica of the group; seeds the replicated state.
    Bootstrap,
    /// Additional replica joining an existing group.
    Join,
}

/// Everything the engine needs to start one replica.
pub struct ReplicaSpec {
    /// Group the replica belongs to.
    pub group: GroupName,
    /// Opaque engine configuration (election timing, snapshot cadence, ...).
    pub rv_config: RvConfig,
    /// Directory for the group's durable state, when persistence is on.
    pub persistence_dir: Option<PathBuf>,
    /// Bootstrap or join semantics.
    pub mode: StartMode,
    /// The machine this replica applies commands to.
    pub machine: Box<dyn StateMachine>,
}

/// Consensus role of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    /// Accepts commands and serves linearizable queries.
    Leader,
    /// Replicates the leader's log.
    Follower,
    /// Electing.
    Candidate,
}

/// Status snapshot of a local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Current consensus role.
    pub role: ReplicaRole,
    /// Index of the last applied log entry.
    pub last_applied: u64,
}

/// Driver interface of the external consensus engine.
///
/// All methods address the replica hosted on the local node; routing to
/// other nodes happens above this seam.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Start a local replica.
    ///
    /// Fails with `ProcessExists` when the node already hosts a replica of
    /// the group (or, for [`StartMode::Bootstrap`], when the group already
    /// exists anywhere). A [`StartMode::Join`] against a group nobody has
    /// bootstrapped fails; only the bootstrap handshake creates groups.
    async fn start_replica(&self, spec: ReplicaSpec) -> ClusterResult<ReplicaRef>;

    /// Stop the local replica of a group.
    async fn stop_replica(&self, group: &GroupName) -> ClusterResult<()>;

    /// Submit a command to the local replica.
    ///
    /// `reference` deduplicates retried submissions: a command seen twice
    /// applies once and replays its original reply.
    async fn command(
        &self,
        group: &GroupName,
        arg: Bytes,
        timeout: Duration,
        reference: CommandRef,
    ) -> RpcResult<Bytes>;

    /// Run a linearizable query on the local replica.
    async fn query(&self, group: &GroupName, arg: Bytes, timeout: Duration) -> RpcResult<Bytes>;

    /// Status of the local replica, `None` when the node hosts none.
    async fn status(&self, group: &GroupName) -> Option<ReplicaStatus>;
}
