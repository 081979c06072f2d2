//! Change events flowing pool → node → registry → volume manager.
//!
//! Every create/modify/delete of a cached entity emits exactly one event.
//! Consumers match on the object tag; payloads are defensive copies of the
//! cached state at emission time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core::nexus::NexusInfo;
use crate::core::node::NodeInfo;
use crate::core::pool::PoolInfo;
use crate::core::replica::ReplicaInfo;

/// Capacity of the registry broadcast channel. Slow consumers lag and drop
/// the oldest events; the periodic sync re-converges the model afterwards.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    New,
    Mod,
    Del,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::New => write!(f, "new"),
            EventAction::Mod => write!(f, "mod"),
            EventAction::Del => write!(f, "del"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventObject {
    Node(NodeInfo),
    Pool(PoolInfo),
    Replica(ReplicaInfo),
    Nexus(NexusInfo),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub action: EventAction,
    pub object: EventObject,
}

/// Event source handed to a node (and through it to its entities) by the
/// registry. Once the node is removed from the registry the sender is
/// retired and every later emission is dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<Event>,
    retired: Arc<AtomicBool>,
}

impl EventSender {
    pub(crate) fn new(tx: broadcast::Sender<Event>) -> Self {
        Self {
            tx,
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop relaying events from this source.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }

    pub fn emit(&self, action: EventAction, object: EventObject) {
        if self.retired.load(Ordering::Relaxed) {
            return;
        }
        // A send error only means there is no subscriber right now.
        let _ = self.tx.send(Event { action, object });
    }

    /// Sender wired to a fresh channel; emissions go nowhere.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::new(tx)
    }

    /// Sender plus a subscribed receiver, for asserting on emissions.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, broadcast::Receiver<Event>) {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (Self::new(tx), rx)
    }
}

/// Create the shared event channel for a registry.
pub(crate) fn channel() -> (broadcast::Sender<Event>, broadcast::Receiver<Event>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
