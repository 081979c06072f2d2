//! Storage-node object: one RPC session plus the entities discovered on the
//! node, kept current by a periodic sync.
//!
//! Connection lifecycle is a small state machine
//! (`disconnected → connecting → connected → disconnected`): entering
//! `connected` runs an initial sync; any failed RPC in the sync loop drops
//! back to `disconnected` and schedules a reconnect with bounded exponential
//! backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::core::event::{EventAction, EventObject, EventSender};
use crate::core::nexus::{ChildInfo, Nexus, NexusInfo};
use crate::core::node_client::NodeClient;
use crate::core::pool::{Pool, PoolInfo, PoolState};
use crate::core::replica::{ReplicaInfo, ShareProtocol};
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of a node, also the payload of node events.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub endpoint: String,
    pub online: bool,
}

/// Tunables inherited from [`Config`](crate::common::Config).
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Caches {
    connection: ConnectionState,
    pools: HashMap<String, Pool>,
    nexuses: HashMap<Uuid, Nexus>,
}

pub struct Node {
    name: String,
    client: NodeClient,
    caches: Mutex<Caches>,
    events: EventSender,
    options: NodeOptions,
    shutdown: Notify,
    closed: AtomicBool,
}

impl Node {
    pub fn new(name: String, endpoint: String, events: EventSender, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            name,
            client: NodeClient::new(endpoint, options.request_timeout, options.connect_timeout),
            caches: Mutex::new(Caches {
                connection: ConnectionState::Disconnected,
                pools: HashMap::new(),
                nexuses: HashMap::new(),
            }),
            events,
            options,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    /// Spawn the connection/sync loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut delay = self.options.backoff_floor;
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return;
            }
            match self.connect_and_sync().await {
                Ok(()) => {
                    delay = self.options.backoff_floor;
                    self.sync_loop().await;
                    if self.closed.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        "Connect to node {} ({}) failed: {}",
                        self.name,
                        self.endpoint(),
                        e
                    );
                    self.mark_offline().await;
                }
            }
            // Bounded exponential backoff with a little jitter so a fleet
            // does not reconnect in lockstep.
            let jitter = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(0..=delay.as_millis() as u64 / 4 + 1))
            };
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(delay + jitter) => {}
            }
            delay = (delay * 2).min(self.options.backoff_cap);
        }
    }

    /// `disconnected → connecting → connected`, then the initial sync.
    async fn connect_and_sync(&self) -> Result<()> {
        {
            let mut caches = self.caches.lock().await;
            caches.connection = ConnectionState::Connecting;
        }
        self.client.connect().await?;
        {
            let mut caches = self.caches.lock().await;
            caches.connection = ConnectionState::Connected;
        }
        self.events
            .emit(EventAction::Mod, EventObject::Node(self.node_info(true)));
        self.sync().await?;
        tracing::info!("Node {} ({}) is online", self.name, self.endpoint());
        Ok(())
    }

    /// Periodic sync until an RPC fails or the node is shut down.
    async fn sync_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(self.options.sync_interval) => {}
            }
            if let Err(e) = self.sync().await {
                tracing::warn!("Sync of node {} failed: {}", self.name, e);
                self.mark_offline().await;
                return;
            }
        }
    }

    async fn mark_offline(&self) {
        self.client.disconnect().await;
        let mut caches = self.caches.lock().await;
        if caches.connection != ConnectionState::Disconnected {
            caches.connection = ConnectionState::Disconnected;
            for pool in caches.pools.values_mut() {
                pool.offline(&self.events);
            }
            self.events
                .emit(EventAction::Mod, EventObject::Node(self.node_info(false)));
            tracing::warn!("Node {} ({}) is offline", self.name, self.endpoint());
        }
    }

    /// Stop the sync loop and drop the channel. Terminal.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        self.client.disconnect().await;
        let mut caches = self.caches.lock().await;
        caches.connection = ConnectionState::Disconnected;
    }

    fn node_info(&self, online: bool) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            endpoint: self.endpoint().to_string(),
            online,
        }
    }

    // === Sync ===

    /// Enumerate the node and apply a three-way diff (`new`/`mod`/`del`)
    /// against the cached entities, one event per change.
    pub async fn sync(&self) -> Result<()> {
        let pools = self.client.list_pools().await?;
        let replicas = self.client.list_replicas().await?;
        let nexuses = self.client.list_nexus().await?;

        let pools: Vec<PoolInfo> = pools.into_iter().map(|p| self.pool_from_rpc(p)).collect();
        let mut replicas_by_pool: HashMap<String, Vec<ReplicaInfo>> = HashMap::new();
        for r in replicas {
            match self.replica_from_rpc(r) {
                Some(info) => replicas_by_pool.entry(info.pool.clone()).or_default().push(info),
                None => continue,
            }
        }
        let nexuses: Vec<NexusInfo> = nexuses
            .into_iter()
            .filter_map(|n| self.nexus_from_rpc(n))
            .collect();

        let mut caches = self.caches.lock().await;
        self.apply_sync(&mut caches, pools, replicas_by_pool, nexuses);
        Ok(())
    }

    fn apply_sync(
        &self,
        caches: &mut Caches,
        mut pools: Vec<PoolInfo>,
        mut replicas_by_pool: HashMap<String, Vec<ReplicaInfo>>,
        nexuses: Vec<NexusInfo>,
    ) {
        // Deterministic event order within one sync pass.
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        let mut seen_pools = std::collections::HashSet::new();
        for info in pools {
            seen_pools.insert(info.name.clone());
            let replicas = replicas_by_pool.remove(&info.name).unwrap_or_default();
            match caches.pools.get_mut(&info.name) {
                Some(pool) => pool.merge(&info, replicas, &self.events),
                None => {
                    // `pool new` strictly precedes the `replica new` of its
                    // replicas.
                    self.events
                        .emit(EventAction::New, EventObject::Pool(info.clone()));
                    let mut pool = Pool::new(info);
                    pool.merge_replicas(replicas, &self.events);
                    caches.pools.insert(pool.info().name.clone(), pool);
                }
            }
        }

        let mut gone: Vec<String> = caches
            .pools
            .keys()
            .filter(|name| !seen_pools.contains(*name))
            .cloned()
            .collect();
        gone.sort();
        for name in gone {
            if let Some(pool) = caches.pools.remove(&name) {
                // `replica del` strictly precedes the owning `pool del`.
                let info = pool.drain(&self.events);
                self.events.emit(EventAction::Del, EventObject::Pool(info));
            }
        }

        let mut seen_nexuses = std::collections::HashSet::new();
        for info in nexuses {
            seen_nexuses.insert(info.uuid);
            match caches.nexuses.get_mut(&info.uuid) {
                Some(nexus) => nexus.merge(&info, &self.events),
                None => {
                    self.events
                        .emit(EventAction::New, EventObject::Nexus(info.clone()));
                    caches.nexuses.insert(info.uuid, Nexus::new(info));
                }
            }
        }
        let gone: Vec<Uuid> = caches
            .nexuses
            .keys()
            .filter(|uuid| !seen_nexuses.contains(*uuid))
            .copied()
            .collect();
        for uuid in gone {
            if let Some(nexus) = caches.nexuses.remove(&uuid) {
                self.events
                    .emit(EventAction::Del, EventObject::Nexus(nexus.into_info()));
            }
        }
    }

    // === RPC → entity conversions ===

    fn pool_from_rpc(&self, p: proto::Pool) -> PoolInfo {
        let state = PoolState::from(p.state());
        PoolInfo {
            node: self.name.clone(),
            name: p.name,
            disks: p.disks,
            state,
            capacity: p.capacity,
            used: p.used,
        }
    }

    fn replica_from_rpc(&self, r: proto::Replica) -> Option<ReplicaInfo> {
        let uuid = match Uuid::parse_str(&r.uuid) {
            Ok(uuid) => uuid,
            Err(_) => {
                tracing::warn!("Node {} reported replica with invalid uuid {}", self.name, r.uuid);
                return None;
            }
        };
        let share = ShareProtocol::from(r.share());
        let state = r.state();
        Some(ReplicaInfo {
            node: self.name.clone(),
            pool: r.pool,
            uuid,
            size: r.size,
            thin: r.thin,
            share,
            uri: r.uri,
            state: state.into(),
        })
    }

    fn nexus_from_rpc(&self, n: proto::Nexus) -> Option<NexusInfo> {
        let uuid = match Uuid::parse_str(&n.uuid) {
            Ok(uuid) => uuid,
            Err(_) => {
                tracing::warn!("Node {} reported nexus with invalid uuid {}", self.name, n.uuid);
                return None;
            }
        };
        let state = n.state().into();
        Some(NexusInfo {
            node: self.name.clone(),
            uuid,
            size: n.size,
            state,
            children: n
                .children
                .into_iter()
                .map(|c| {
                    let state = c.state().into();
                    ChildInfo { uri: c.uri, state }
                })
                .collect(),
            device_uri: if n.device_uri.is_empty() {
                None
            } else {
                Some(n.device_uri)
            },
        })
    }

    // === Queries (defensive copies) ===

    pub async fn info(&self) -> NodeInfo {
        let caches = self.caches.lock().await;
        NodeInfo {
            name: self.name.clone(),
            endpoint: self.endpoint().to_string(),
            online: caches.connection == ConnectionState::Connected,
        }
    }

    pub async fn is_online(&self) -> bool {
        self.caches.lock().await.connection == ConnectionState::Connected
    }

    pub async fn pools(&self) -> Vec<PoolInfo> {
        let caches = self.caches.lock().await;
        caches.pools.values().map(|p| p.info().clone()).collect()
    }

    pub async fn pool(&self, name: &str) -> Option<PoolInfo> {
        let caches = self.caches.lock().await;
        caches.pools.get(name).map(|p| p.info().clone())
    }

    /// Pools with their current replica counts, for placement.
    pub async fn pool_candidates(&self) -> Vec<(PoolInfo, usize)> {
        let caches = self.caches.lock().await;
        caches
            .pools
            .values()
            .map(|p| (p.info().clone(), p.replica_count()))
            .collect()
    }

    pub async fn replicas(&self) -> Vec<ReplicaInfo> {
        let caches = self.caches.lock().await;
        caches
            .pools
            .values()
            .flat_map(|p| p.replicas().map(|r| r.info().clone()))
            .collect()
    }

    pub async fn nexuses(&self) -> Vec<NexusInfo> {
        let caches = self.caches.lock().await;
        caches.nexuses.values().map(|n| n.info().clone()).collect()
    }

    pub async fn nexus(&self, uuid: &Uuid) -> Option<NexusInfo> {
        let caches = self.caches.lock().await;
        caches.nexuses.get(uuid).map(|n| n.info().clone())
    }

    // === Mutators ===
    //
    // Each issues the RPC, then updates the cache optimistically; the next
    // sync pass reconciles whatever the node actually did.

    pub async fn create_pool(&self, name: &str, disks: Vec<String>) -> Result<PoolInfo> {
        match self.client.create_pool(name, disks).await {
            Ok(()) => {}
            // The caller treats an existing pool as success; the refresh
            // below merges its actual attributes.
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        // Capacity and state are only known to the node; fetch them rather
        // than guessing.
        let listed = self.client.list_pools().await?;
        let info = listed
            .into_iter()
            .map(|p| self.pool_from_rpc(p))
            .find(|p| p.name == name)
            .ok_or_else(|| Error::Internal(format!("created pool {} did not appear", name)))?;

        let mut caches = self.caches.lock().await;
        match caches.pools.get_mut(name) {
            Some(pool) => pool.merge_info(&info, &self.events),
            None => {
                self.events
                    .emit(EventAction::New, EventObject::Pool(info.clone()));
                caches.pools.insert(name.to_string(), Pool::new(info.clone()));
            }
        }
        Ok(info)
    }

    pub async fn destroy_pool(&self, name: &str) -> Result<()> {
        match self.client.destroy_pool(name).await {
            Ok(()) => {}
            // Idempotent destroy.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut caches = self.caches.lock().await;
        if let Some(pool) = caches.pools.remove(name) {
            let info = pool.drain(&self.events);
            self.events.emit(EventAction::Del, EventObject::Pool(info));
        }
        Ok(())
    }

    pub async fn create_replica(
        &self,
        uuid: &Uuid,
        pool: &str,
        size: u64,
        thin: bool,
    ) -> Result<ReplicaInfo> {
        let uri = match self
            .client
            .create_replica(uuid, pool, size, thin, proto::ShareProtocolReplica::ReplicaNone)
            .await
        {
            Ok(uri) => uri,
            Err(e) if e.is_already_exists() => {
                // Adopt the existing replica only if a re-enumeration
                // confirms the identity (same uuid on the same pool);
                // anything else is a real collision.
                return self.adopt_replica(uuid, pool).await.ok_or(e);
            }
            Err(e) => return Err(e),
        };

        let info = ReplicaInfo {
            node: self.name.clone(),
            pool: pool.to_string(),
            uuid: *uuid,
            size,
            thin,
            share: ShareProtocol::None,
            uri,
            state: crate::core::replica::ReplicaState::Online,
        };
        let mut caches = self.caches.lock().await;
        match caches.pools.get_mut(pool) {
            Some(p) => p.insert_replica(info.clone(), &self.events),
            None => tracing::warn!(
                "Replica {} created on unknown pool {}@{}",
                uuid,
                pool,
                self.name
            ),
        }
        Ok(info)
    }

    async fn adopt_replica(&self, uuid: &Uuid, pool: &str) -> Option<ReplicaInfo> {
        let listed = self.client.list_replicas().await.ok()?;
        let info = listed
            .into_iter()
            .filter_map(|r| self.replica_from_rpc(r))
            .find(|r| r.uuid == *uuid && r.pool == pool)?;
        let mut caches = self.caches.lock().await;
        if let Some(p) = caches.pools.get_mut(pool) {
            if p.replica(uuid).is_none() {
                p.insert_replica(info.clone(), &self.events);
            }
        }
        tracing::info!("Adopted existing replica {} on {}@{}", uuid, pool, self.name);
        Some(info)
    }

    pub async fn destroy_replica(&self, uuid: &Uuid) -> Result<()> {
        match self.client.destroy_replica(uuid).await {
            Ok(()) => {}
            // Idempotent destroy.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut caches = self.caches.lock().await;
        for pool in caches.pools.values_mut() {
            pool.remove_replica(uuid, &self.events);
        }
        Ok(())
    }

    pub async fn share_replica(&self, uuid: &Uuid, share: ShareProtocol) -> Result<String> {
        let uri = self.client.share_replica(uuid, share.into()).await?;
        let mut caches = self.caches.lock().await;
        for pool in caches.pools.values_mut() {
            if let Some(replica) = pool.replica_mut(uuid) {
                replica.set_share(share, uri.clone(), &self.events);
            }
        }
        Ok(uri)
    }

    pub async fn create_nexus(
        &self,
        uuid: &Uuid,
        size: u64,
        children: Vec<String>,
    ) -> Result<NexusInfo> {
        match self.client.create_nexus(uuid, size, children.clone()).await {
            Ok(()) => {}
            // An existing nexus with this uuid is ours (uuid = volume uuid).
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        let info = NexusInfo {
            node: self.name.clone(),
            uuid: *uuid,
            size,
            state: crate::core::nexus::NexusState::Online,
            children: children
                .into_iter()
                .map(|uri| ChildInfo {
                    uri,
                    state: crate::core::nexus::ChildState::Online,
                })
                .collect(),
            device_uri: None,
        };
        let mut caches = self.caches.lock().await;
        if caches.nexuses.get(uuid).is_none() {
            self.events
                .emit(EventAction::New, EventObject::Nexus(info.clone()));
            caches.nexuses.insert(*uuid, Nexus::new(info.clone()));
        }
        Ok(info)
    }

    pub async fn destroy_nexus(&self, uuid: &Uuid) -> Result<()> {
        match self.client.destroy_nexus(uuid).await {
            Ok(()) => {}
            // Idempotent destroy.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut caches = self.caches.lock().await;
        if let Some(nexus) = caches.nexuses.remove(uuid) {
            self.events
                .emit(EventAction::Del, EventObject::Nexus(nexus.into_info()));
        }
        Ok(())
    }

    pub async fn add_nexus_child(&self, uuid: &Uuid, uri: &str) -> Result<()> {
        match self.client.add_child_nexus(uuid, uri).await {
            Ok(()) => {}
            // The child is already mirrored; nothing to do.
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        let mut caches = self.caches.lock().await;
        if let Some(nexus) = caches.nexuses.get_mut(uuid) {
            nexus.add_child(uri.to_string(), &self.events);
        }
        Ok(())
    }

    pub async fn remove_nexus_child(&self, uuid: &Uuid, uri: &str) -> Result<()> {
        match self.client.remove_child_nexus(uuid, uri).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut caches = self.caches.lock().await;
        if let Some(nexus) = caches.nexuses.get_mut(uuid) {
            nexus.remove_child(uri, &self.events);
        }
        Ok(())
    }

    pub async fn publish_nexus(
        &self,
        uuid: &Uuid,
        share: proto::ShareProtocolNexus,
    ) -> Result<String> {
        let device_uri = self.client.publish_nexus(uuid, share).await?;
        let mut caches = self.caches.lock().await;
        if let Some(nexus) = caches.nexuses.get_mut(uuid) {
            nexus.set_published(device_uri.clone(), &self.events);
        }
        Ok(device_uri)
    }

    pub async fn unpublish_nexus(&self, uuid: &Uuid) -> Result<()> {
        match self.client.unpublish_nexus(uuid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut caches = self.caches.lock().await;
        if let Some(nexus) = caches.nexuses.get_mut(uuid) {
            nexus.set_unpublished(&self.events);
        }
        Ok(())
    }
}

#[cfg(test)]
impl Node {
    pub(crate) fn test(name: &str, events: EventSender) -> Arc<Self> {
        Self::new(
            name.to_string(),
            format!("{}.test:10124", name),
            events,
            NodeOptions::default(),
        )
    }

    pub(crate) async fn set_online(&self, online: bool) {
        let mut caches = self.caches.lock().await;
        caches.connection = if online {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
    }

    pub(crate) async fn inject_pool(&self, info: PoolInfo) {
        let mut caches = self.caches.lock().await;
        caches.pools.insert(info.name.clone(), Pool::new(info));
    }

    pub(crate) async fn inject_replica(&self, info: ReplicaInfo) {
        let mut caches = self.caches.lock().await;
        if let Some(pool) = caches.pools.get_mut(&info.pool) {
            pool.insert_replica(info, &self.events);
        }
    }

    pub(crate) async fn inject_nexus(&self, info: NexusInfo) {
        let mut caches = self.caches.lock().await;
        caches.nexuses.insert(info.uuid, Nexus::new(info));
    }
}
