//! # blockplane
//!
//! Control plane for a distributed block-storage provisioner:
//! - A live, in-memory registry of storage nodes and the pools, replicas and
//!   nexuses discovered on them
//! - A volume orchestrator that composes those primitives into replicated
//!   volumes and converges them toward their spec
//! - A CSI Identity/Controller façade served on a Unix domain socket
//!
//! ## Architecture
//!
//! ```text
//!            orchestrator (CSI over UDS)
//!                      │
//!          ┌───────────▼───────────┐
//!          │      blockplane       │
//!          │  registry + volumes   │
//!          └───┬───────┬───────┬───┘
//!              │ gRPC  │       │
//!        ┌─────▼──┐ ┌──▼─────┐ ┌▼───────┐
//!        │ node 1 │ │ node 2 │ │ node 3 │
//!        │ pools  │ │ pools  │ │ pools  │
//!        └────────┘ └────────┘ └────────┘
//! ```
//!
//! The control plane keeps no durable state: on startup it reconstructs its
//! model by enumerating every registered node, and keeps it current with a
//! periodic per-node sync that emits `new`/`mod`/`del` events up the chain
//! (pool → node → registry → volume manager).

#![allow(clippy::result_large_err)]

pub mod common;
pub mod core;
pub mod csi;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use crate::core::{Registry, VolumeManager};

// Generated protobuf code: south-bound storage-node service
pub mod proto {
    tonic::include_proto!("mayastor");
}

// Generated protobuf code: north-bound CSI services
pub mod csi_proto {
    tonic::include_proto!("csi.v1");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin name advertised by the CSI identity service
pub const PLUGIN_NAME: &str = "io.openebs.csi-mayastor";
