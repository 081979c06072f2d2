//! Configuration for the blockplane control plane

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::proto::ShareProtocolNexus;

/// Control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// CSI socket path (Unix domain socket)
    #[serde(default = "default_csi_socket")]
    pub csi_socket: PathBuf,

    /// Storage nodes registered at startup
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Per-node sync interval
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Deadline for a single outbound node RPC
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deadline for establishing a node channel
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Reconnect backoff floor
    #[serde(default = "default_backoff_floor")]
    pub reconnect_backoff_ms: u64,

    /// Reconnect backoff cap
    #[serde(default = "default_backoff_cap")]
    pub reconnect_backoff_cap_ms: u64,

    /// Interval between reconcile passes over unhealthy volumes
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Share protocol used when publishing a nexus
    #[serde(default)]
    pub publish_protocol: PublishProtocol,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_csi_socket() -> PathBuf {
    PathBuf::from("/var/tmp/csi.sock")
}
fn default_sync_interval() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_backoff_floor() -> u64 {
    1_000
}
fn default_backoff_cap() -> u64 {
    30_000
}
fn default_reconcile_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            csi_socket: default_csi_socket(),
            nodes: vec![],
            sync_interval_secs: default_sync_interval(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_backoff_ms: default_backoff_floor(),
            reconnect_backoff_cap_ms: default_backoff_cap(),
            reconcile_interval_secs: default_reconcile_interval(),
            publish_protocol: PublishProtocol::default(),
            log_level: default_log_level(),
        }
    }
}

/// A storage node registered at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Unique, user-assigned node name
    pub name: String,

    /// `host:port` (TCP) or an absolute socket path (UDS)
    pub endpoint: String,
}

impl std::str::FromStr for NodeConfig {
    type Err = crate::Error;

    /// Parse the `name=endpoint` form used on the command line.
    fn from_str(s: &str) -> crate::Result<Self> {
        match s.split_once('=') {
            Some((name, endpoint)) if !name.is_empty() && !endpoint.is_empty() => Ok(Self {
                name: name.to_string(),
                endpoint: endpoint.to_string(),
            }),
            _ => Err(crate::Error::InvalidConfig(format!(
                "expected name=endpoint, got '{}'",
                s
            ))),
        }
    }
}

/// Share protocol for published nexuses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishProtocol {
    Nbd,
    #[default]
    Nvmf,
    Iscsi,
}

impl From<PublishProtocol> for ShareProtocolNexus {
    fn from(p: PublishProtocol) -> Self {
        match p {
            PublishProtocol::Nbd => ShareProtocolNexus::NexusNbd,
            PublishProtocol::Nvmf => ShareProtocolNexus::NexusNvmf,
            PublishProtocol::Iscsi => ShareProtocolNexus::NexusIscsi,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(crate::Error::InvalidConfig("node name is required".into()));
            }
            if node.endpoint.is_empty() {
                return Err(crate::Error::InvalidConfig(format!(
                    "node {} has no endpoint",
                    node.name
                )));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(crate::Error::InvalidConfig(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
        }
        if self.sync_interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "sync_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_backoff_ms),
            Duration::from_millis(self.reconnect_backoff_cap_ms),
        )
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
