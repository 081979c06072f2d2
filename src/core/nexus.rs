//! Nexus entity: the logical frontend of a volume, mirroring writes across
//! replica children and exposing a block device when published.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::{EventAction, EventObject, EventSender};
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NexusState {
    Online,
    Degraded,
    Faulted,
    Offline,
}

impl std::fmt::Display for NexusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NexusState::Online => write!(f, "online"),
            NexusState::Degraded => write!(f, "degraded"),
            NexusState::Faulted => write!(f, "faulted"),
            NexusState::Offline => write!(f, "offline"),
        }
    }
}

impl From<proto::NexusState> for NexusState {
    fn from(s: proto::NexusState) -> Self {
        match s {
            proto::NexusState::NexusOnline => NexusState::Online,
            proto::NexusState::NexusDegraded => NexusState::Degraded,
            proto::NexusState::NexusFaulted => NexusState::Faulted,
            proto::NexusState::NexusOffline => NexusState::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    Online,
    Degraded,
    Faulted,
}

impl From<proto::ChildState> for ChildState {
    fn from(s: proto::ChildState) -> Self {
        match s {
            proto::ChildState::ChildOnline => ChildState::Online,
            proto::ChildState::ChildDegraded => ChildState::Degraded,
            proto::ChildState::ChildFaulted => ChildState::Faulted,
        }
    }
}

/// One mirrored child of a nexus; `uri` points at a replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildInfo {
    pub uri: String,
    pub state: ChildState,
}

/// Snapshot of a nexus, also the payload of nexus events.
#[derive(Debug, Clone, PartialEq)]
pub struct NexusInfo {
    /// Node the nexus runs on; the accessibility point of the volume
    pub node: String,
    /// Equals the volume uuid
    pub uuid: Uuid,
    pub size: u64,
    pub state: NexusState,
    /// Order-significant child list
    pub children: Vec<ChildInfo>,
    /// Block-device URI, set iff published
    pub device_uri: Option<String>,
}

impl NexusInfo {
    pub fn child_uris(&self) -> Vec<String> {
        self.children.iter().map(|c| c.uri.clone()).collect()
    }

    pub fn has_child(&self, uri: &str) -> bool {
        self.children.iter().any(|c| c.uri == uri)
    }

    pub fn published(&self) -> bool {
        self.device_uri.is_some()
    }
}

/// Cached nexus owned by a [`Node`](crate::core::node::Node).
#[derive(Debug)]
pub struct Nexus {
    info: NexusInfo,
}

impl Nexus {
    pub fn new(info: NexusInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &NexusInfo {
        &self.info
    }

    pub fn into_info(self) -> NexusInfo {
        self.info
    }

    /// Update volatile attributes (`state`, `children`, `device_uri`) from a
    /// sync observation; size and identity are fixed at creation.
    pub fn merge(&mut self, new: &NexusInfo, events: &EventSender) {
        let volatile_changed = self.info.state != new.state
            || self.info.children != new.children
            || self.info.device_uri != new.device_uri;
        if volatile_changed {
            self.info.state = new.state;
            self.info.children = new.children.clone();
            self.info.device_uri = new.device_uri.clone();
            events.emit(EventAction::Mod, EventObject::Nexus(self.info.clone()));
        }
    }

    /// Record a child added through `AddChildNexus`. The child starts
    /// degraded until the dataplane has rebuilt it; sync refreshes the state.
    pub fn add_child(&mut self, uri: String, events: &EventSender) {
        if !self.info.has_child(&uri) {
            self.info.children.push(ChildInfo {
                uri,
                state: ChildState::Degraded,
            });
            events.emit(EventAction::Mod, EventObject::Nexus(self.info.clone()));
        }
    }

    /// Record a child removed through `RemoveChildNexus`.
    pub fn remove_child(&mut self, uri: &str, events: &EventSender) {
        let before = self.info.children.len();
        self.info.children.retain(|c| c.uri != uri);
        if self.info.children.len() != before {
            events.emit(EventAction::Mod, EventObject::Nexus(self.info.clone()));
        }
    }

    /// Record a successful `PublishNexus`.
    pub fn set_published(&mut self, device_uri: String, events: &EventSender) {
        if self.info.device_uri.as_deref() != Some(device_uri.as_str()) {
            self.info.device_uri = Some(device_uri);
            events.emit(EventAction::Mod, EventObject::Nexus(self.info.clone()));
        }
    }

    /// Record a successful `UnpublishNexus`.
    pub fn set_unpublished(&mut self, events: &EventSender) {
        if self.info.device_uri.take().is_some() {
            events.emit(EventAction::Mod, EventObject::Nexus(self.info.clone()));
        }
    }
}
