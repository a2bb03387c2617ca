//! Armada Core Library
//!
//! Foundational building blocks for the armada fleet layer: strongly-typed
//! identifiers, the stable rendezvous hash, and the zone-aware replica
//! placement function.
//!
//! Everything in this crate is pure and deterministic: no I/O, no clocks, no
//! async. The cluster layer (`armada-cluster`) builds the replicated state
//! machine and the per-node coordination loops on top of these primitives.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hash;
pub mod placement;
pub mod types;

pub use placement::lrw_members;
pub use types::{CommandRef, GroupName, NodeId, ReplicaRef, RvConfig, ZoneId};
