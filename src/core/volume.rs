//! Volume: a nexus plus its replicas under one uuid, and the `ensure()`
//! reconciler that converges the observed objects toward the spec.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{join_errors, Error, Result};
use crate::core::event::EventAction;
use crate::core::nexus::NexusInfo;
use crate::core::registry::Registry;
use crate::core::replica::{ReplicaInfo, ReplicaState, ShareProtocol};
use crate::proto::ShareProtocolNexus;

/// User-requested shape of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Desired number of replicas, at least one
    pub replica_count: u64,
    /// Replicas may only land on these nodes (strict); empty means anywhere
    pub required_nodes: Vec<String>,
    /// Soft placement preference
    pub preferred_nodes: Vec<String>,
    pub required_bytes: u64,
    /// 0 means no upper bound was given
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Pending,
    Online,
    Degraded,
    Faulted,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Pending => write!(f, "pending"),
            VolumeState::Online => write!(f, "online"),
            VolumeState::Degraded => write!(f, "degraded"),
            VolumeState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Snapshot of a volume for callers outside the manager.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub uuid: Uuid,
    pub spec: VolumeSpec,
    pub size: u64,
    pub state: VolumeState,
    pub reason: String,
    pub replicas: Vec<ReplicaInfo>,
    pub nexus: Option<NexusInfo>,
}

pub struct Volume {
    uuid: Uuid,
    spec: VolumeSpec,
    registry: Arc<Registry>,
    publish_protocol: ShareProtocolNexus,
    /// Fixed by the first reconcile that creates replicas
    size: u64,
    /// At most one replica per node, keyed by node name
    replicas: BTreeMap<String, ReplicaInfo>,
    nexus: Option<NexusInfo>,
    state: VolumeState,
    reason: String,
}

impl Volume {
    pub fn new(
        uuid: Uuid,
        spec: VolumeSpec,
        registry: Arc<Registry>,
        publish_protocol: ShareProtocolNexus,
    ) -> Self {
        Self {
            uuid,
            spec,
            registry,
            publish_protocol,
            size: 0,
            replicas: BTreeMap::new(),
            nexus: None,
            state: VolumeState::Pending,
            reason: "volume has not been reconciled".to_string(),
        }
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn state(&self) -> VolumeState {
        self.state
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn nexus(&self) -> Option<&NexusInfo> {
        self.nexus.as_ref()
    }

    /// Spec satisfied: full replica set plus a nexus.
    pub fn is_complete(&self) -> bool {
        self.nexus.is_some() && self.replicas.len() as u64 >= self.spec.replica_count
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            uuid: self.uuid,
            spec: self.spec.clone(),
            size: self.size,
            state: self.state,
            reason: self.reason.clone(),
            replicas: self.replicas.values().cloned().collect(),
            nexus: self.nexus.clone(),
        }
    }

    /// Adopt whatever the registry already knows about this uuid (model
    /// reconstruction after a control-plane restart).
    pub async fn import_from_registry(&mut self) {
        for replica in self.registry.get_replicas(Some(&self.uuid)).await {
            self.replicas.insert(replica.node.clone(), replica);
        }
        self.nexus = self.registry.get_nexus(&self.uuid).await;
        if self.size == 0 {
            self.size = match &self.nexus {
                Some(nexus) => nexus.size,
                None => self.replicas.values().map(|r| r.size).min().unwrap_or(0),
            };
        }
        self.refresh_state();
    }

    /// Re-spec the volume. The byte range may not contradict an already
    /// fixed size; volumes do not resize.
    pub fn update(&mut self, spec: &VolumeSpec) -> Result<bool> {
        if spec.replica_count == 0 {
            return Err(Error::InvalidArgument(
                "replica count must be at least one".into(),
            ));
        }
        if self.size != 0 {
            if spec.required_bytes > self.size {
                return Err(Error::InvalidArgument(format!(
                    "volume {} is {} bytes and cannot grow to {}",
                    self.uuid, self.size, spec.required_bytes
                )));
            }
            if spec.limit_bytes != 0 && spec.limit_bytes < self.size {
                return Err(Error::InvalidArgument(format!(
                    "volume {} is {} bytes and cannot shrink below {}",
                    self.uuid, self.size, spec.limit_bytes
                )));
            }
        }
        if self.spec != *spec {
            self.spec = spec.clone();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // === The reconciler ===

    /// Converge observed state toward the spec. Idempotent; the only place
    /// that drives convergence.
    pub async fn ensure(&mut self) -> Result<()> {
        let result = self.reconcile().await;
        match &result {
            Ok(()) => self.refresh_state(),
            Err(e) => {
                self.reason = e.to_string();
                if self.nexus.is_none() {
                    self.state = VolumeState::Pending;
                }
            }
        }
        result
    }

    async fn reconcile(&mut self) -> Result<()> {
        self.replenish_replicas().await?;

        // Rank and split into members and excess.
        let ranked = self.rank_replicas();
        let members: Vec<String> = ranked
            .iter()
            .take(self.spec.replica_count as usize)
            .map(|r| r.node.clone())
            .collect();

        let local_node = self.ensure_share_protocols(&members).await?;
        self.ensure_nexus(&members, &local_node).await?;
        self.trim_replicas().await;
        Ok(())
    }

    /// Step 1: create replicas until the spec count is reached.
    async fn replenish_replicas(&mut self) -> Result<()> {
        let missing = self
            .spec
            .replica_count
            .saturating_sub(self.replicas.len() as u64);
        if missing == 0 {
            return Ok(());
        }

        let mut pools = self
            .registry
            .choose_pools(
                self.spec.required_bytes,
                &self.spec.required_nodes,
                &self.spec.preferred_nodes,
            )
            .await;
        // Nodes already hosting a replica of this volume are off limits.
        pools.retain(|p| !self.replicas.contains_key(&p.node));

        if (pools.len() as u64) < missing {
            return Err(Error::ResourceExhausted(format!(
                "volume {} needs {} new replica(s) but only {} pool(s) qualify",
                self.uuid,
                missing,
                pools.len()
            )));
        }

        if self.size == 0 {
            // The conservative choice: bounded by the emptiest chosen pool,
            // not by its total capacity.
            let min_free = pools
                .iter()
                .map(|p| p.free_bytes())
                .min()
                .unwrap_or(self.spec.required_bytes);
            let ceiling = if self.spec.limit_bytes != 0 {
                self.spec.limit_bytes
            } else {
                self.spec.required_bytes
            };
            self.size = min_free.min(ceiling);
        }

        let mut errors = vec![];
        let mut created = 0u64;
        for pool in pools {
            if created == missing {
                break;
            }
            let node = match self.registry.get_node(&pool.node).await {
                Some(node) => node,
                None => {
                    errors.push(format!("node {} is gone", pool.node));
                    continue;
                }
            };
            match node.create_replica(&self.uuid, &pool.name, self.size, true).await {
                Ok(info) => {
                    tracing::debug!(
                        "Created replica {} on {}@{}",
                        self.uuid,
                        pool.name,
                        pool.node
                    );
                    self.replicas.insert(pool.node.clone(), info);
                    created += 1;
                }
                Err(e) => errors.push(format!(
                    "create replica on {}@{}: {}",
                    pool.name, pool.node, e
                )),
            }
        }

        if created < missing {
            return Err(Error::Internal(join_errors(&errors)));
        }
        Ok(())
    }

    /// Step 2: deterministic replica ranking, best first.
    fn rank_replicas(&self) -> Vec<ReplicaInfo> {
        // BTreeMap iteration pins the tie-break order to node names.
        let mut ranked: Vec<ReplicaInfo> = self.replicas.values().cloned().collect();
        ranked.sort_by(|a, b| self.score_replica(b).cmp(&self.score_replica(a)));
        ranked
    }

    fn score_replica(&self, replica: &ReplicaInfo) -> u32 {
        let mut score = 0;
        if self.spec.required_nodes.contains(&replica.node) {
            score += 10;
        }
        if replica.state == ReplicaState::Online {
            score += 5;
        }
        if self.spec.preferred_nodes.contains(&replica.node) {
            score += 2;
        }
        if let Some(nexus) = &self.nexus {
            if nexus.node == replica.node {
                score += 1;
            }
        }
        score
    }

    /// Step 3: the replica local to the nexus is consumed as a bdev, every
    /// remote member is exported over nvmf. Returns the nexus node.
    async fn ensure_share_protocols(&mut self, members: &[String]) -> Result<String> {
        let local_node = match &self.nexus {
            Some(nexus) => nexus.node.clone(),
            None => members
                .first()
                .cloned()
                .ok_or_else(|| Error::Internal(format!("volume {} has no replicas", self.uuid)))?,
        };

        for node_name in members {
            let replica = match self.replicas.get(node_name) {
                Some(replica) => replica.clone(),
                None => continue,
            };
            let desired = if *node_name == local_node {
                ShareProtocol::None
            } else {
                ShareProtocol::Nvmf
            };
            if replica.share == desired {
                continue;
            }
            // A protocol the nexus cannot reach makes the volume unusable,
            // so any failure here is fatal.
            let node = self.registry.get_node(node_name).await.ok_or_else(|| {
                Error::Internal(format!("node {} hosting a replica is gone", node_name))
            })?;
            let uri = match node.share_replica(&replica.uuid, desired).await {
                Ok(uri) => uri,
                Err(e) if e.is_not_found() && desired == ShareProtocol::None => {
                    // The replica vanished under us; its del event prunes it.
                    continue;
                }
                Err(e) => {
                    return Err(Error::Internal(format!(
                        "set share {} on replica of {} at {}: {}",
                        desired, self.uuid, node_name, e
                    )))
                }
            };
            if let Some(cached) = self.replicas.get_mut(node_name) {
                cached.share = desired;
                cached.uri = uri;
            }
        }
        Ok(local_node)
    }

    /// Step 4: create the nexus, or reconcile its child set against the
    /// member replicas.
    async fn ensure_nexus(&mut self, members: &[String], local_node: &str) -> Result<()> {
        let member_uris: Vec<String> = members
            .iter()
            .filter_map(|n| self.replicas.get(n).map(|r| r.uri.clone()))
            .collect();

        match self.nexus.clone() {
            None => {
                let node = self.registry.get_node(local_node).await.ok_or_else(|| {
                    Error::Unavailable(format!("node {} is not registered", local_node))
                })?;
                let info = node
                    .create_nexus(&self.uuid, self.size, member_uris)
                    .await
                    .map_err(|e| {
                        Error::Internal(format!("create nexus for {}: {}", self.uuid, e))
                    })?;
                tracing::info!("Created nexus for volume {} on {}", self.uuid, local_node);
                self.nexus = Some(info);
            }
            Some(nexus) => {
                let node = self.registry.get_node(&nexus.node).await.ok_or_else(|| {
                    Error::Unavailable(format!("node {} is not registered", nexus.node))
                })?;
                let desired: HashSet<&String> = member_uris.iter().collect();
                let current = nexus.child_uris();

                // Excess children first; failures are logged and retried by
                // a later reconcile.
                for uri in current.iter().filter(|uri| !desired.contains(uri)) {
                    match node.remove_nexus_child(&self.uuid, uri).await {
                        Ok(()) => {
                            if let Some(nexus) = self.nexus.as_mut() {
                                nexus.children.retain(|c| c.uri != *uri);
                            }
                        }
                        Err(e) => tracing::warn!(
                            "Cannot remove child {} from nexus {}: {}",
                            uri,
                            self.uuid,
                            e
                        ),
                    }
                }

                // Missing children are required for the volume to reach its
                // replica count; failure aborts.
                for uri in member_uris.iter().filter(|uri| !nexus.has_child(uri)) {
                    node.add_nexus_child(&self.uuid, uri).await.map_err(|e| {
                        Error::Internal(format!(
                            "add child {} to nexus {}: {}",
                            uri, self.uuid, e
                        ))
                    })?;
                    if let Some(nexus) = self.nexus.as_mut() {
                        nexus.children.push(crate::core::nexus::ChildInfo {
                            uri: uri.clone(),
                            state: crate::core::nexus::ChildState::Degraded,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 5: destroy replicas the nexus does not mirror.
    async fn trim_replicas(&mut self) {
        let member_uris: HashSet<String> = match &self.nexus {
            Some(nexus) => nexus.child_uris().into_iter().collect(),
            None => return,
        };
        let strays: Vec<ReplicaInfo> = self
            .replicas
            .values()
            .filter(|r| !member_uris.contains(&r.uri))
            .cloned()
            .collect();
        for replica in strays {
            match self.registry.get_node(&replica.node).await {
                Some(node) => match node.destroy_replica(&replica.uuid).await {
                    Ok(()) => {
                        tracing::debug!(
                            "Trimmed excess replica of {} on {}",
                            self.uuid,
                            replica.node
                        );
                        self.replicas.remove(&replica.node);
                    }
                    Err(e) => tracing::warn!(
                        "Cannot trim excess replica of {} on {}: {}",
                        self.uuid,
                        replica.node,
                        e
                    ),
                },
                None => tracing::warn!(
                    "Cannot trim excess replica of {}: node {} is gone",
                    self.uuid,
                    replica.node
                ),
            }
        }
    }

    // === Publish / destroy ===

    /// Expose the volume as a block device on the nexus node.
    pub async fn publish(&mut self) -> Result<String> {
        let nexus = self
            .nexus
            .clone()
            .ok_or_else(|| Error::Unavailable(format!("volume {} has no nexus", self.uuid)))?;
        if let Some(uri) = &nexus.device_uri {
            return Ok(uri.clone());
        }
        let node = self
            .registry
            .get_node(&nexus.node)
            .await
            .ok_or_else(|| Error::Unavailable(format!("node {} is not registered", nexus.node)))?;

        match node.publish_nexus(&self.uuid, self.publish_protocol).await {
            Ok(uri) => {
                if let Some(nexus) = self.nexus.as_mut() {
                    nexus.device_uri = Some(uri.clone());
                }
                Ok(uri)
            }
            Err(e) if e.is_already_exists() => {
                // Published out of band; refresh and take the device we find.
                node.sync().await.ok();
                match node.nexus(&self.uuid).await.and_then(|n| n.device_uri) {
                    Some(uri) => {
                        if let Some(nexus) = self.nexus.as_mut() {
                            nexus.device_uri = Some(uri.clone());
                        }
                        Ok(uri)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Withdraw the block device. Idempotent.
    pub async fn unpublish(&mut self) -> Result<()> {
        let nexus = match self.nexus.clone() {
            Some(nexus) => nexus,
            None => return Ok(()),
        };
        let node = self
            .registry
            .get_node(&nexus.node)
            .await
            .ok_or_else(|| Error::Unavailable(format!("node {} is not registered", nexus.node)))?;
        node.unpublish_nexus(&self.uuid).await?;
        if let Some(nexus) = self.nexus.as_mut() {
            nexus.device_uri = None;
        }
        Ok(())
    }

    /// Destroy the nexus (if any), then every replica in parallel.
    pub async fn destroy(&mut self) -> Result<()> {
        let mut errors = vec![];

        if let Some(nexus) = self.nexus.take() {
            match self.registry.get_node(&nexus.node).await {
                Some(node) => {
                    if let Err(e) = node.destroy_nexus(&self.uuid).await {
                        errors.push(format!("destroy nexus on {}: {}", nexus.node, e));
                    }
                }
                None => errors.push(format!("node {} hosting the nexus is gone", nexus.node)),
            }
        }

        let registry = self.registry.clone();
        let uuid = self.uuid;
        let destroys = self.replicas.values().map(|replica| {
            let registry = registry.clone();
            let node_name = replica.node.clone();
            async move {
                match registry.get_node(&node_name).await {
                    Some(node) => node
                        .destroy_replica(&uuid)
                        .await
                        .map(|_| node_name.clone())
                        .map_err(|e| format!("destroy replica on {}: {}", node_name, e)),
                    None => Err(format!("node {} hosting a replica is gone", node_name)),
                }
            }
        });
        for result in join_all(destroys).await {
            match result {
                Ok(node_name) => {
                    self.replicas.remove(&node_name);
                }
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(join_errors(&errors)))
        }
    }

    // === Event handlers ===
    //
    // Keep the in-memory view aligned with registry events. They never call
    // the reconciler; the manager re-runs `ensure()` on its own schedule.

    pub fn on_replica_event(&mut self, action: EventAction, replica: &ReplicaInfo) {
        debug_assert_eq!(replica.uuid, self.uuid);
        match action {
            EventAction::New | EventAction::Mod => {
                self.replicas.insert(replica.node.clone(), replica.clone());
            }
            EventAction::Del => {
                self.replicas.remove(&replica.node);
            }
        }
        self.refresh_state();
    }

    pub fn on_nexus_event(&mut self, action: EventAction, nexus: &NexusInfo) {
        debug_assert_eq!(nexus.uuid, self.uuid);
        match action {
            EventAction::New | EventAction::Mod => {
                self.nexus = Some(nexus.clone());
            }
            EventAction::Del => {
                if self.nexus.as_ref().map(|n| n.node == nexus.node).unwrap_or(false) {
                    self.nexus = None;
                }
            }
        }
        self.refresh_state();
    }

    fn refresh_state(&mut self) {
        use crate::core::nexus::NexusState;
        let (state, reason) = match &self.nexus {
            None => (VolumeState::Pending, "volume has no nexus".to_string()),
            Some(nexus) => match nexus.state {
                NexusState::Faulted => (VolumeState::Faulted, "nexus is faulted".to_string()),
                NexusState::Offline => (VolumeState::Faulted, "nexus is offline".to_string()),
                NexusState::Degraded => (VolumeState::Degraded, "nexus is degraded".to_string()),
                NexusState::Online => {
                    if self.replicas.len() as u64 >= self.spec.replica_count {
                        (VolumeState::Online, String::new())
                    } else {
                        (
                            VolumeState::Degraded,
                            format!(
                                "{} of {} replicas",
                                self.replicas.len(),
                                self.spec.replica_count
                            ),
                        )
                    }
                }
            },
        };
        self.state = state;
        self.reason = reason;
    }
}
