//! Pool entity: a disk aggregate on one node, the allocation arena for
//! replicas.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::{EventAction, EventObject, EventSender};
use crate::core::replica::{Replica, ReplicaInfo};
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Online,
    Degraded,
    Faulted,
    Offline,
}

impl PoolState {
    /// Accessible pools can host new replicas.
    pub fn accessible(&self) -> bool {
        matches!(self, PoolState::Online | PoolState::Degraded)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Online => write!(f, "online"),
            PoolState::Degraded => write!(f, "degraded"),
            PoolState::Faulted => write!(f, "faulted"),
            PoolState::Offline => write!(f, "offline"),
        }
    }
}

impl From<proto::PoolState> for PoolState {
    fn from(s: proto::PoolState) -> Self {
        match s {
            proto::PoolState::PoolOnline => PoolState::Online,
            proto::PoolState::PoolDegraded => PoolState::Degraded,
            proto::PoolState::PoolFaulted => PoolState::Faulted,
            proto::PoolState::PoolOffline => PoolState::Offline,
        }
    }
}

/// Snapshot of a pool, also the payload of pool events.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInfo {
    /// Node the pool is bound to
    pub node: String,
    /// Unique within the node
    pub name: String,
    /// Immutable after creation
    pub disks: Vec<String>,
    pub state: PoolState,
    pub capacity: u64,
    pub used: u64,
}

impl PoolInfo {
    pub fn free_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    pub fn accessible(&self) -> bool {
        self.state.accessible()
    }
}

/// Cached pool owned by a [`Node`](crate::core::node::Node), holding the
/// replicas discovered on it.
#[derive(Debug)]
pub struct Pool {
    info: PoolInfo,
    replicas: HashMap<Uuid, Replica>,
}

impl Pool {
    pub fn new(info: PoolInfo) -> Self {
        Self {
            info,
            replicas: HashMap::new(),
        }
    }

    pub fn info(&self) -> &PoolInfo {
        &self.info
    }

    pub fn replica(&self, uuid: &Uuid) -> Option<&Replica> {
        self.replicas.get(uuid)
    }

    pub fn replica_mut(&mut self, uuid: &Uuid) -> Option<&mut Replica> {
        self.replicas.get_mut(uuid)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Record a replica we just created through this pool's node.
    pub fn insert_replica(&mut self, info: ReplicaInfo, events: &EventSender) {
        events.emit(EventAction::New, EventObject::Replica(info.clone()));
        self.replicas.insert(info.uuid, Replica::new(info));
    }

    /// Drop a replica that was destroyed (or confirmed gone) on the node.
    pub fn remove_replica(&mut self, uuid: &Uuid, events: &EventSender) {
        if let Some(replica) = self.replicas.remove(uuid) {
            events.emit(EventAction::Del, EventObject::Replica(replica.into_info()));
        }
    }

    /// Apply a sync observation: update volatile attributes (`state`,
    /// `capacity`, `used`), then diff the owned replica set by uuid.
    ///
    /// Identity attributes (`name`, `disks`) never change after creation, so
    /// a difference there is not a modification and emits nothing.
    pub fn merge(&mut self, new: &PoolInfo, replicas: Vec<ReplicaInfo>, events: &EventSender) {
        self.merge_info(new, events);
        self.merge_replicas(replicas, events);
    }

    /// Volatile-attribute update only; the replica set is left alone.
    pub fn merge_info(&mut self, new: &PoolInfo, events: &EventSender) {
        let volatile_changed = self.info.state != new.state
            || self.info.capacity != new.capacity
            || self.info.used != new.used;
        if volatile_changed {
            self.info.state = new.state;
            self.info.capacity = new.capacity;
            self.info.used = new.used;
            events.emit(EventAction::Mod, EventObject::Pool(self.info.clone()));
        }
    }

    /// Three-way diff of the cached replicas against a fresh enumeration.
    pub fn merge_replicas(&mut self, replicas: Vec<ReplicaInfo>, events: &EventSender) {
        let mut seen = HashSet::new();
        for info in replicas {
            seen.insert(info.uuid);
            match self.replicas.get_mut(&info.uuid) {
                Some(replica) => replica.merge(&info, events),
                None => self.insert_replica(info, events),
            }
        }
        let gone: Vec<Uuid> = self
            .replicas
            .keys()
            .filter(|uuid| !seen.contains(*uuid))
            .copied()
            .collect();
        for uuid in gone {
            self.remove_replica(&uuid, events);
        }
    }

    /// The node went away: mark the pool offline and cascade to replicas.
    pub fn offline(&mut self, events: &EventSender) {
        if self.info.state != PoolState::Offline {
            self.info.state = PoolState::Offline;
            events.emit(EventAction::Mod, EventObject::Pool(self.info.clone()));
        }
        for replica in self.replicas.values_mut() {
            replica.offline(events);
        }
    }

    /// Replica-del events for every owned replica, then nothing; used when
    /// the pool itself disappears so children are reported gone first.
    pub fn drain(mut self, events: &EventSender) -> PoolInfo {
        let uuids: Vec<Uuid> = self.replicas.keys().copied().collect();
        for uuid in uuids {
            self.remove_replica(&uuid, events);
        }
        self.info
    }
}
