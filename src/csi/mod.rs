//! The CSI façade: Identity and Controller services over a UDS.

pub mod controller;
pub mod identity;
pub mod server;

pub use controller::CsiController;
pub use identity::CsiIdentity;
pub use server::CsiServer;
