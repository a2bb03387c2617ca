//! Fleet coordination for Raft consensus groups.
//!
//! This crate manages a fleet of consensus groups spread across a cluster of
//! nodes. A distinguished cluster group replicates the fleet's root of trust:
//! which nodes are active in which availability zone, which groups exist, and
//! where their replicas belong. Everything else follows from that state.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Fleet                                 │
//! │                                                               │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐        │
//! │  │   Node a    │    │   Node b    │    │   Node c    │        │
//! │  │             │    │             │    │             │        │
//! │  │ ┌─────────┐ │    │ ┌─────────┐ │    │ ┌─────────┐ │        │
//! │  │ │ Manager │◄┼────┼─┤ cluster │◄┼────┼─┤ Manager │ │        │
//! │  │ └────┬────┘ │    │ │  group  │ │    │ └────┬────┘ │        │
//! │  │      │      │    │ └─────────┘ │    │      │      │        │
//! │  │ ┌────▼────┐ │    │             │    │ ┌────▼────┐ │        │
//! │  │ │ replica │ │    │  replicas   │    │ │ replica │ │        │
//! │  │ │  set    │ │    │  of user    │    │ │  set    │ │        │
//! │  │ └─────────┘ │    │  groups     │    │ └─────────┘ │        │
//! │  └─────────────┘    └─────────────┘    └─────────────┘        │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each node runs a [`FleetNode`]: its [`manager`] reconciles the local
//! replica set against the placements derived from the cluster state, the
//! [`purge`] controller (on the cluster-group leader) evicts nodes that stay
//! unhealthy, and the [`refresh`] loop keeps the leader cache warm. Client
//! traffic goes through [`resolve`], which caches leaders and retries with a
//! bounded budget.
//!
//! The consensus engine itself is a collaborator behind the
//! [`engine::ConsensusEngine`] trait; the crate ships an in-process engine
//! and fabric for single-process clusters and tests.
//!
//! # Usage
//!
//! ```ignore
//! use armada_cluster::{FleetConfig, FleetNode};
//! use armada_cluster::engine::{EngineBoard, InProcessEngine};
//! use armada_cluster::net::LocalFabric;
//! use armada_core::types::{GroupName, NodeId, RvConfig, ZoneId};
//! use std::sync::Arc;
//!
//! let fabric = LocalFabric::new();
//! let board = EngineBoard::new();
//! let id = NodeId::new("a");
//! let engine = InProcessEngine::new(id.clone(), board.clone(), fabric.clone());
//! let node = FleetNode::start(
//!     id.clone(),
//!     FleetConfig::default(),
//!     Arc::new(fabric.handle(id.clone())),
//!     Arc::new(engine),
//! )?;
//! fabric.register(id, node.rpc_service());
//!
//! node.activate(ZoneId::new("1")).await?;
//! node.add_consensus_group(GroupName::new("orders"), 3, RvConfig::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod net;
mod node;
pub mod purge;
pub mod refresh;
pub mod resolve;
pub mod service;
pub mod state;

pub use command::{cluster_group, ClusterCommand, CLUSTER_GROUP};
pub use config::{CallOptions, FleetConfig, FleetConfigBuilder};
pub use error::{ClusterError, ClusterResult, RpcError, RpcResult};
pub use node::FleetNode;
