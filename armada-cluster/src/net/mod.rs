//! Inter-node communication.
//!
//! Outbound calls go through the [`Transport`] trait; inbound requests land
//! on a node's registered [`RpcService`]. The in-process [`LocalFabric`]
//! wires both sides together for single-process clusters and tests.

mod local;
mod transport;

pub use local::{FabricHandle, LocalFabric};
pub use transport::{AddGroupOutcome, RpcRequest, RpcResponse, RpcService, Transport};
