//! Byte-level adapters between the replicated machines and the engine.
//!
//! The consensus engine replicates opaque bytes; these adapters give it the
//! two machines the fleet needs. `ClusterMachine` runs the fleet state for
//! the cluster group, `OpaqueMachine` holds the uninterpreted value of a user
//! group. Both encode with serde_json so every replica derives identical
//! replies from identical log entries.

use bytes::Bytes;
use serde::Serialize;

use crate::command::ClusterCommand;
use crate::engine::StateMachine;
use crate::state::{answer_query, apply_command, ClusterQuery, ClusterState, CommandOutcome, QueryReply};

fn encode<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!(error = %e, "reply failed to serialize");
            Bytes::new()
        }
    }
}

/// The cluster group's replicated machine.
#[derive(Debug, Default)]
pub struct ClusterMachine {
    state: ClusterState,
}

impl ClusterMachine {
    /// Create an empty machine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for ClusterMachine {
    fn apply(&mut self, command: &[u8]) -> Bytes {
        let outcome = match serde_json::from_slice::<ClusterCommand>(command) {
            Ok(cmd) => {
                tracing::debug!(command = cmd.name(), "applying cluster command");
                apply_command(&mut self.state, cmd)
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed cluster command");
                CommandOutcome::Malformed
            }
        };
        encode(&outcome)
    }

    fn query(&self, arg: &[u8]) -> Bytes {
        let reply = match serde_json::from_slice::<ClusterQuery>(arg) {
            Ok(query) => answer_query(&self.state, &query),
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed cluster query");
                QueryReply::Malformed
            }
        };
        encode(&reply)
    }

    fn snapshot(&self) -> Bytes {
        encode(&self.state)
    }

    fn restore(&mut self, snapshot: &[u8]) {
        match serde_json::from_slice(snapshot) {
            Ok(state) => self.state = state,
            Err(e) => tracing::error!(error = %e, "cluster snapshot failed to decode"),
        }
    }
}

/// Replicated machine of a user group.
///
/// The value is a single opaque payload: a command replaces it and echoes the
/// previous value, a query returns it untouched. Anything richer lives on the
/// client side of the group.
#[derive(Debug, Default)]
pub struct OpaqueMachine {
    value: Bytes,
}

impl OpaqueMachine {
    /// Create a machine holding an empty value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for OpaqueMachine {
    fn apply(&mut self, command: &[u8]) -> Bytes {
        std::mem::replace(&mut self.value, Bytes::copy_from_slice(command))
    }

    fn query(&self, _arg: &[u8]) -> Bytes {
        self.value.clone()
    }

    fn snapshot(&self) -> Bytes {
        self.value.clone()
    }

    fn restore(&mut self, snapshot: &[u8]) {
        self.value = Bytes::copy_from_slice(snapshot);
    }
}
