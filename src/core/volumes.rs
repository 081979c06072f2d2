//! Volume manager: the process-wide `uuid → Volume` map, per-volume
//! serialization, event dispatch and the periodic re-reconcile loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::common::{join_errors, Error, PublishProtocol, Result};
use crate::core::event::{Event, EventObject};
use crate::core::registry::Registry;
use crate::core::volume::{Volume, VolumeInfo, VolumeSpec, VolumeState};
use crate::proto::ShareProtocolNexus;

pub struct VolumeManager {
    registry: Arc<Registry>,
    /// Per-volume mutex: at most one reconcile (or destroy) per uuid at a
    /// time, and CSI requests serialize on the same lock.
    volumes: Mutex<HashMap<Uuid, Arc<Mutex<Volume>>>>,
    publish_protocol: ShareProtocolNexus,
    reconcile_interval: Duration,
}

impl VolumeManager {
    pub fn new(
        registry: Arc<Registry>,
        publish_protocol: PublishProtocol,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            volumes: Mutex::new(HashMap::new()),
            publish_protocol: publish_protocol.into(),
            reconcile_interval,
        })
    }

    /// Spawn the event-dispatch and periodic-reconcile loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut events = self.registry.subscribe();
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events are recovered by the next sync pass.
                        tracing::warn!("Volume manager lagged behind {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = ticker.tick() => self.reconcile_unhealthy().await,
            }
        }
    }

    /// Route a registry event to the volume it belongs to, if any.
    async fn dispatch(&self, event: Event) {
        let uuid = match &event.object {
            EventObject::Replica(replica) => replica.uuid,
            EventObject::Nexus(nexus) => nexus.uuid,
            EventObject::Node(_) | EventObject::Pool(_) => return,
        };
        let volume = {
            let volumes = self.volumes.lock().await;
            volumes.get(&uuid).cloned()
        };
        let Some(volume) = volume else { return };
        let mut volume = volume.lock().await;
        match &event.object {
            EventObject::Replica(replica) => volume.on_replica_event(event.action, replica),
            EventObject::Nexus(nexus) => volume.on_nexus_event(event.action, nexus),
            _ => {}
        }
    }

    /// Re-run `ensure()` for every volume that is not fully healthy, so
    /// replica loss converges back without an external trigger.
    async fn reconcile_unhealthy(&self) {
        let entries: Vec<(Uuid, Arc<Mutex<Volume>>)> = {
            let volumes = self.volumes.lock().await;
            volumes.iter().map(|(u, v)| (*u, v.clone())).collect()
        };
        for (uuid, volume) in entries {
            let mut volume = volume.lock().await;
            if volume.state() == VolumeState::Online {
                continue;
            }
            if let Err(e) = volume.ensure().await {
                tracing::warn!("Reconcile of volume {} failed: {}", uuid, e);
            }
        }
    }

    /// Create or re-spec a volume, then converge it. Holding the per-uuid
    /// lock across the whole reconcile keeps concurrent CSI calls for the
    /// same volume strictly ordered.
    pub async fn ensure_volume(&self, uuid: &Uuid, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let (volume, created) = self.get_or_create(uuid, spec).await;
        let mut volume = volume.lock().await;
        if created {
            volume.import_from_registry().await;
        }
        let changed = volume.update(spec)?;
        // A re-issued CreateVolume with an identical spec and a converged
        // volume is a no-op.
        if !created && !changed && volume.is_complete() {
            return Ok(volume.info());
        }
        volume.ensure().await?;
        Ok(volume.info())
    }

    pub async fn get_volume(&self, uuid: &Uuid) -> Option<VolumeInfo> {
        let volume = {
            let volumes = self.volumes.lock().await;
            volumes.get(uuid).cloned()
        };
        match volume {
            Some(volume) => Some(volume.lock().await.info()),
            None => None,
        }
    }

    pub async fn list_volumes(&self) -> Vec<VolumeInfo> {
        let entries: Vec<Arc<Mutex<Volume>>> = {
            let volumes = self.volumes.lock().await;
            volumes.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(entries.len());
        for volume in entries {
            out.push(volume.lock().await.info());
        }
        out.sort_by_key(|v| v.uuid);
        out
    }

    /// Expose the volume's block device. Valid once a nexus exists.
    pub async fn publish_volume(&self, uuid: &Uuid) -> Result<VolumeInfo> {
        let volume = self.lookup(uuid).await?;
        let mut volume = volume.lock().await;
        volume.publish().await?;
        Ok(volume.info())
    }

    /// Withdraw the block device. Idempotent.
    pub async fn unpublish_volume(&self, uuid: &Uuid) -> Result<()> {
        let volume = self.lookup(uuid).await?;
        let mut volume = volume.lock().await;
        volume.unpublish().await
    }

    /// Destroy the volume's nexus and replicas and forget it. Unknown
    /// volumes still get their stray objects cleared, which also makes the
    /// operation idempotent.
    pub async fn destroy_volume(&self, uuid: &Uuid) -> Result<()> {
        let volume = {
            let volumes = self.volumes.lock().await;
            volumes.get(uuid).cloned()
        };
        match volume {
            Some(volume) => {
                // Waits for any in-flight reconcile on this uuid.
                let mut locked = volume.lock().await;
                locked.destroy().await?;
                drop(locked);
                self.volumes.lock().await.remove(uuid);
                tracing::info!("Destroyed volume {}", uuid);
                Ok(())
            }
            None => self.destroy_unmanaged(uuid).await,
        }
    }

    /// Destroy whatever the registry knows about a uuid we hold no volume
    /// object for (control plane restarted, or the create never finished).
    async fn destroy_unmanaged(&self, uuid: &Uuid) -> Result<()> {
        let mut errors = vec![];

        if let Some(nexus) = self.registry.get_nexus(uuid).await {
            match self.registry.get_node(&nexus.node).await {
                Some(node) => {
                    if let Err(e) = node.destroy_nexus(uuid).await {
                        errors.push(format!("destroy nexus on {}: {}", nexus.node, e));
                    }
                }
                None => errors.push(format!("node {} hosting the nexus is gone", nexus.node)),
            }
        }

        for replica in self.registry.get_replicas(Some(uuid)).await {
            match self.registry.get_node(&replica.node).await {
                Some(node) => {
                    if let Err(e) = node.destroy_replica(uuid).await {
                        errors.push(format!("destroy replica on {}: {}", replica.node, e));
                    }
                }
                None => errors.push(format!("node {} hosting a replica is gone", replica.node)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(join_errors(&errors)))
        }
    }

    async fn lookup(&self, uuid: &Uuid) -> Result<Arc<Mutex<Volume>>> {
        let volumes = self.volumes.lock().await;
        volumes
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("volume {} does not exist", uuid)))
    }

    async fn get_or_create(&self, uuid: &Uuid, spec: &VolumeSpec) -> (Arc<Mutex<Volume>>, bool) {
        let mut volumes = self.volumes.lock().await;
        if let Some(volume) = volumes.get(uuid) {
            return (volume.clone(), false);
        }
        let volume = Arc::new(Mutex::new(Volume::new(
            *uuid,
            spec.clone(),
            self.registry.clone(),
            self.publish_protocol,
        )));
        volumes.insert(*uuid, volume.clone());
        (volume, true)
    }
}
