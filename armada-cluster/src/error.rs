//! Error types for fleet operations.

use armada_core::types::{GroupName, NodeId};
use thiserror::Error;

/// Result type for fleet operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Errors surfaced by the public fleet API.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The retry budget ran out without a successful leader dispatch.
    #[error("no leader responded for group {group} within the retry budget")]
    NoLeader {
        /// Group the dispatch targeted.
        group: GroupName,
    },

    /// `activate` was called on a node that is already active.
    #[error("node is already active")]
    NotInactive,

    /// `deactivate` was called on a node that is not active.
    #[error("node is not active")]
    Inactive,

    /// The consensus group is already registered and not tombstoned.
    #[error("consensus group {0} already added")]
    AlreadyAdded(GroupName),

    /// The consensus group is not registered.
    #[error("consensus group {0} not found")]
    NotFound(GroupName),

    /// A replica of the group is already running where one was to be started.
    #[error("replica of group {group} already running on node {node}")]
    ProcessExists {
        /// Group whose replica collided.
        group: GroupName,
        /// Node hosting the existing replica.
        node: NodeId,
    },

    /// A replicated command or reply failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// Opaque failure reported by the consensus engine.
    #[error("engine error: {0}")]
    Engine(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Codec(e.to_string())
    }
}

/// Result type at the RPC boundary.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Failures observed at the RPC boundary.
///
/// Both kinds are retryable from the caller's point of view: a fresh leader
/// lookup may route the next attempt somewhere healthier. Application-level
/// rejections from a committed command never appear here; they travel inside
/// successful replies and are terminal.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The remote endpoint could not be reached, or the call timed out.
    #[error("transport failure reaching {node}: {reason}")]
    Transport {
        /// Target of the failed call.
        node: NodeId,
        /// What went wrong.
        reason: String,
    },

    /// The addressed replica is not the group leader.
    #[error("node {node} is not the leader of {group}")]
    NotLeader {
        /// Group the call addressed.
        group: GroupName,
        /// Node that declined.
        node: NodeId,
        /// Current leader, if the responder knows one.
        hint: Option<NodeId>,
    },
}

impl RpcError {
    /// Shorthand for a transport-class failure.
    pub fn transport(node: &NodeId, reason: impl Into<String>) -> Self {
        RpcError::Transport {
            node: node.clone(),
            reason: reason.into(),
        }
    }
}
