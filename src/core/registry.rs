//! Registry: the in-memory catalog of storage nodes and the query surface
//! over everything discovered on them.
//!
//! All queries return defensive copies; the only writers are the per-node
//! sync tasks and the mutators reached through [`Node`] handles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::core::event::{self, Event, EventAction, EventObject, EventSender};
use crate::core::nexus::NexusInfo;
use crate::core::node::{Node, NodeInfo, NodeOptions};
use crate::core::placement::{self, PoolCandidate};
use crate::core::pool::PoolInfo;
use crate::core::replica::ReplicaInfo;

struct NodeEntry {
    node: Arc<Node>,
    sender: EventSender,
}

pub struct Registry {
    nodes: RwLock<HashMap<String, NodeEntry>>,
    events_tx: broadcast::Sender<Event>,
    node_options: NodeOptions,
}

impl Registry {
    pub fn new(node_options: NodeOptions) -> Arc<Self> {
        let (events_tx, _) = event::channel();
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            events_tx,
            node_options,
        })
    }

    /// Subscribe to the relayed `node|pool|replica|nexus` event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    fn emit(&self, action: EventAction, object: EventObject) {
        let _ = self.events_tx.send(Event { action, object });
    }

    /// Register a node. Idempotent by name; a changed endpoint replaces the
    /// node (the old session is torn down and a fresh one connects).
    pub async fn add_node(&self, name: &str, endpoint: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(entry) = nodes.get(name) {
            if entry.node.endpoint() == endpoint {
                return;
            }
        }
        if let Some(entry) = nodes.remove(name) {
            tracing::info!(
                "Node {} endpoint changed {} -> {}",
                name,
                entry.node.endpoint(),
                endpoint
            );
            entry.sender.retire();
            entry.node.disconnect().await;
            let info = entry.node.info().await;
            self.emit(EventAction::Del, EventObject::Node(info));
        }

        let sender = EventSender::new(self.events_tx.clone());
        let node = Node::new(
            name.to_string(),
            endpoint.to_string(),
            sender.clone(),
            self.node_options.clone(),
        );
        self.emit(
            EventAction::New,
            EventObject::Node(NodeInfo {
                name: name.to_string(),
                endpoint: endpoint.to_string(),
                online: false,
            }),
        );
        node.spawn();
        tracing::info!("Registered node {} ({})", name, endpoint);
        nodes.insert(name.to_string(), NodeEntry { node, sender });
    }

    /// Remove a node. Events still in flight from it are dropped.
    pub async fn remove_node(&self, name: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(entry) = nodes.remove(name) {
            entry.sender.retire();
            entry.node.disconnect().await;
            let info = entry.node.info().await;
            self.emit(EventAction::Del, EventObject::Node(info));
            tracing::info!("Removed node {}", name);
        }
    }

    pub async fn get_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().await.get(name).map(|e| e.node.clone())
    }

    pub async fn get_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut out = Vec::with_capacity(nodes.len());
        for entry in nodes.values() {
            out.push(entry.node.info().await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get_pools(&self) -> Vec<PoolInfo> {
        let nodes = self.nodes.read().await;
        let mut out = vec![];
        for entry in nodes.values() {
            out.extend(entry.node.pools().await);
        }
        out
    }

    pub async fn get_pool(&self, node: &str, name: &str) -> Option<PoolInfo> {
        let node = self.get_node(node).await?;
        node.pool(name).await
    }

    /// Replicas across the fleet, optionally restricted to one volume uuid.
    pub async fn get_replicas(&self, uuid: Option<&Uuid>) -> Vec<ReplicaInfo> {
        let nodes = self.nodes.read().await;
        let mut out = vec![];
        for entry in nodes.values() {
            out.extend(
                entry
                    .node
                    .replicas()
                    .await
                    .into_iter()
                    .filter(|r| uuid.map_or(true, |u| r.uuid == *u)),
            );
        }
        out
    }

    pub async fn get_nexuses(&self) -> Vec<NexusInfo> {
        let nodes = self.nodes.read().await;
        let mut out = vec![];
        for entry in nodes.values() {
            out.extend(entry.node.nexuses().await);
        }
        out
    }

    /// The nexus with this uuid, if any node runs one. Uuids are volume
    /// uuids, so at most one match exists fleet-wide.
    pub async fn get_nexus(&self, uuid: &Uuid) -> Option<NexusInfo> {
        let nodes = self.nodes.read().await;
        for entry in nodes.values() {
            if let Some(nexus) = entry.node.nexus(uuid).await {
                return Some(nexus);
            }
        }
        None
    }

    /// Free bytes over accessible pools, fleet-wide or for one node.
    pub async fn get_capacity(&self, node: Option<&str>) -> u64 {
        placement::free_capacity(&self.get_pools().await, node)
    }

    /// The placement algorithm; see [`placement::select_pools`].
    pub async fn choose_pools(
        &self,
        required_bytes: u64,
        must_nodes: &[String],
        should_nodes: &[String],
    ) -> Vec<PoolInfo> {
        let nodes = self.nodes.read().await;
        let mut candidates = vec![];
        for entry in nodes.values() {
            candidates.extend(
                entry
                    .node
                    .pool_candidates()
                    .await
                    .into_iter()
                    .map(|(pool, replicas)| PoolCandidate { pool, replicas }),
            );
        }
        drop(nodes);
        placement::select_pools(candidates, required_bytes, must_nodes, should_nodes)
    }
}

#[cfg(test)]
impl Registry {
    /// Wire an already-constructed node in without spawning its sync loop.
    pub(crate) async fn add_test_node(&self, node: Arc<Node>, sender: EventSender) {
        let mut nodes = self.nodes.write().await;
        nodes.insert(node.name().to_string(), NodeEntry { node, sender });
    }

    pub(crate) fn event_sender(&self) -> EventSender {
        EventSender::new(self.events_tx.clone())
    }
}
