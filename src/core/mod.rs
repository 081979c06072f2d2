//! The in-memory object registry and the volume orchestrator.
//!
//! - [`node_client`] / [`node`]: one reconnectable RPC session per storage
//!   node and the entity caches discovered through it
//! - [`pool`] / [`replica`] / [`nexus`]: passive value objects with identity,
//!   state, and change events
//! - [`registry`] / [`placement`]: the fleet catalog, query surface and the
//!   pool-selection algorithm
//! - [`volume`] / [`volumes`]: the `ensure()` reconciler and the manager
//!   that serializes it per uuid

pub mod event;
pub mod nexus;
pub mod node;
pub mod node_client;
pub mod placement;
pub mod pool;
pub mod registry;
pub mod replica;
pub mod volume;
pub mod volumes;

pub use event::{Event, EventAction, EventObject};
pub use nexus::{ChildInfo, ChildState, NexusInfo, NexusState};
pub use node::{Node, NodeInfo, NodeOptions};
pub use node_client::NodeClient;
pub use pool::{PoolInfo, PoolState};
pub use registry::Registry;
pub use replica::{ReplicaInfo, ReplicaState, ShareProtocol};
pub use volume::{VolumeInfo, VolumeSpec, VolumeState};
pub use volumes::VolumeManager;
