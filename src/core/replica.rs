//! Replica entity: one copy of a volume's data, carved out of a pool.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::{EventAction, EventObject, EventSender};
use crate::proto;

/// Transport by which a nexus reaches a replica. `None` means the replica is
/// consumed locally as a bdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareProtocol {
    None,
    Nvmf,
    Iscsi,
}

impl std::fmt::Display for ShareProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareProtocol::None => write!(f, "none"),
            ShareProtocol::Nvmf => write!(f, "nvmf"),
            ShareProtocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

impl From<proto::ShareProtocolReplica> for ShareProtocol {
    fn from(p: proto::ShareProtocolReplica) -> Self {
        match p {
            proto::ShareProtocolReplica::ReplicaNone => ShareProtocol::None,
            proto::ShareProtocolReplica::ReplicaNvmf => ShareProtocol::Nvmf,
            proto::ShareProtocolReplica::ReplicaIscsi => ShareProtocol::Iscsi,
        }
    }
}

impl From<ShareProtocol> for proto::ShareProtocolReplica {
    fn from(p: ShareProtocol) -> Self {
        match p {
            ShareProtocol::None => proto::ShareProtocolReplica::ReplicaNone,
            ShareProtocol::Nvmf => proto::ShareProtocolReplica::ReplicaNvmf,
            ShareProtocol::Iscsi => proto::ShareProtocolReplica::ReplicaIscsi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Online,
    Degraded,
    Faulted,
    Offline,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Online => write!(f, "online"),
            ReplicaState::Degraded => write!(f, "degraded"),
            ReplicaState::Faulted => write!(f, "faulted"),
            ReplicaState::Offline => write!(f, "offline"),
        }
    }
}

impl From<proto::ReplicaState> for ReplicaState {
    fn from(s: proto::ReplicaState) -> Self {
        match s {
            proto::ReplicaState::ReplicaOnline => ReplicaState::Online,
            proto::ReplicaState::ReplicaDegraded => ReplicaState::Degraded,
            proto::ReplicaState::ReplicaFaulted => ReplicaState::Faulted,
            proto::ReplicaState::ReplicaOffline => ReplicaState::Offline,
        }
    }
}

/// Snapshot of a replica, also the payload of replica events.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaInfo {
    /// Node hosting the pool this replica lives on
    pub node: String,
    /// Pool the replica is carved from
    pub pool: String,
    /// Equals the uuid of the owning volume
    pub uuid: Uuid,
    pub size: u64,
    pub thin: bool,
    pub share: ShareProtocol,
    /// Access URI derived from the share protocol
    pub uri: String,
    pub state: ReplicaState,
}

/// Cached replica owned by a [`Pool`](crate::core::pool::Pool).
#[derive(Debug)]
pub struct Replica {
    info: ReplicaInfo,
}

impl Replica {
    pub fn new(info: ReplicaInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &ReplicaInfo {
        &self.info
    }

    pub fn into_info(self) -> ReplicaInfo {
        self.info
    }

    /// Update volatile attributes from a sync pass. Emits `replica mod` only
    /// when something observable changed; identity (uuid, pool) never moves.
    pub fn merge(&mut self, new: &ReplicaInfo, events: &EventSender) {
        let volatile_changed = self.info.size != new.size
            || self.info.share != new.share
            || self.info.uri != new.uri
            || self.info.state != new.state;
        if volatile_changed {
            self.info.size = new.size;
            self.info.share = new.share;
            self.info.uri = new.uri.clone();
            self.info.state = new.state;
            events.emit(EventAction::Mod, EventObject::Replica(self.info.clone()));
        }
    }

    /// Record a share-protocol change confirmed by the node.
    pub fn set_share(&mut self, share: ShareProtocol, uri: String, events: &EventSender) {
        if self.info.share != share || self.info.uri != uri {
            self.info.share = share;
            self.info.uri = uri;
            events.emit(EventAction::Mod, EventObject::Replica(self.info.clone()));
        }
    }

    /// Cascade from a pool going offline.
    pub fn offline(&mut self, events: &EventSender) {
        if self.info.state != ReplicaState::Offline {
            self.info.state = ReplicaState::Offline;
            events.emit(EventAction::Mod, EventObject::Replica(self.info.clone()));
        }
    }
}
