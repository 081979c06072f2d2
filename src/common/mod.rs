//! Common utilities and types shared across blockplane

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, NodeConfig, PublishProtocol};
pub use error::{Error, Result};
pub use utils::{format_bytes, join_errors};
