//! CSI Controller service: volume lifecycle on behalf of the orchestrator,
//! translated into volume-manager calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::core::registry::Registry;
use crate::core::volume::{VolumeInfo, VolumeSpec};
use crate::core::volumes::VolumeManager;
use crate::csi_proto::controller_server::{Controller, ControllerServer};
use crate::csi_proto::{
    controller_service_capability, list_volumes_response, validate_volume_capabilities_response,
    volume_capability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest, ListVolumesResponse,
    Topology, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    Volume as CsiVolume, VolumeCapability,
};

/// The only topology key this plugin understands.
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Volume names arrive as `pvc-<uuid>`; the uuid becomes the volume id.
static VOLUME_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^pvc-([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$",
    )
    .unwrap()
});

/// Node ids arrive as `mayastor://<node-name>`.
static NODE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^mayastor://([^/]+)$").unwrap());

/// How long an unfinished `ListVolumes` paging context stays resumable.
const PAGING_CONTEXT_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct PagingContexts {
    next_id: u64,
    contexts: HashMap<u64, PagingContext>,
}

struct PagingContext {
    entries: Vec<CsiVolume>,
    created: Instant,
}

impl PagingContexts {
    fn gc(&mut self) {
        self.contexts
            .retain(|_, ctx| ctx.created.elapsed() < PAGING_CONTEXT_TTL);
    }

    fn insert(&mut self, entries: Vec<CsiVolume>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.contexts.insert(
            id,
            PagingContext {
                entries,
                created: Instant::now(),
            },
        );
        id
    }
}

pub struct CsiController {
    registry: Arc<Registry>,
    volumes: Arc<VolumeManager>,
    ready: Arc<AtomicBool>,
    paging: Mutex<PagingContexts>,
}

impl CsiController {
    pub fn new(
        registry: Arc<Registry>,
        volumes: Arc<VolumeManager>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            volumes,
            ready,
            paging: Mutex::new(PagingContexts::default()),
        }
    }

    pub fn into_server(self) -> ControllerServer<Self> {
        ControllerServer::new(self)
    }

    fn check_ready(&self) -> Result<(), Status> {
        if self.ready.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Status::unavailable("CSI controller is not ready"))
        }
    }

    fn volume_to_csi(volume: &VolumeInfo) -> CsiVolume {
        CsiVolume {
            capacity_bytes: volume.size as i64,
            volume_id: volume.uuid.to_string(),
            volume_context: HashMap::new(),
            accessible_topology: volume
                .nexus
                .as_ref()
                .map(|nexus| vec![hostname_topology(&nexus.node)])
                .unwrap_or_default(),
        }
    }
}

fn hostname_topology(node: &str) -> Topology {
    let mut segments = HashMap::new();
    segments.insert(HOSTNAME_TOPOLOGY_KEY.to_string(), node.to_string());
    Topology { segments }
}

fn parse_volume_name(name: &str) -> Result<Uuid, Status> {
    let captures = VOLUME_NAME_RE.captures(name).ok_or_else(|| {
        Status::invalid_argument(format!("expected volume name in pvc-<uuid> form, got {}", name))
    })?;
    Uuid::parse_str(&captures[1])
        .map_err(|_| Status::invalid_argument(format!("invalid uuid in volume name {}", name)))
}

fn parse_node_id(node_id: &str) -> Result<String, Status> {
    let captures = NODE_ID_RE.captures(node_id).ok_or_else(|| {
        Status::invalid_argument(format!(
            "expected node id in mayastor://<node-name> form, got {}",
            node_id
        ))
    })?;
    Ok(captures[1].to_string())
}

fn capability_mode(capability: &VolumeCapability) -> volume_capability::access_mode::Mode {
    capability
        .access_mode
        .as_ref()
        .map(|m| m.mode())
        .unwrap_or(volume_capability::access_mode::Mode::Unknown)
}

fn is_single_node_writer(capability: &VolumeCapability) -> bool {
    capability_mode(capability) == volume_capability::access_mode::Mode::SingleNodeWriter
}

/// Every requested access mode must be `SINGLE_NODE_WRITER`.
fn check_capabilities(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    if capabilities.is_empty() {
        return Err(Status::invalid_argument(
            "at least one volume capability is required",
        ));
    }
    for capability in capabilities {
        if !is_single_node_writer(capability) {
            return Err(Status::invalid_argument(format!(
                "unsupported access mode {:?}, only SINGLE_NODE_WRITER volumes are supported",
                capability_mode(capability)
            )));
        }
    }
    Ok(())
}

/// Extract required/preferred node lists from the accessibility
/// requirements. Foreign keys on the requisite list are an error; on the
/// preferred list they are ignored.
fn parse_topology(
    requirement: Option<crate::csi_proto::TopologyRequirement>,
) -> Result<(Vec<String>, Vec<String>), Status> {
    let Some(requirement) = requirement else {
        return Ok((vec![], vec![]));
    };

    let mut must_nodes = vec![];
    for topology in &requirement.requisite {
        for (key, value) in &topology.segments {
            if key != HOSTNAME_TOPOLOGY_KEY {
                return Err(Status::invalid_argument(format!(
                    "unsupported topology key {} in requisite topology",
                    key
                )));
            }
            must_nodes.push(value.clone());
        }
    }

    let mut should_nodes = vec![];
    for topology in &requirement.preferred {
        if let Some(value) = topology.segments.get(HOSTNAME_TOPOLOGY_KEY) {
            should_nodes.push(value.clone());
        }
    }

    Ok((must_nodes, should_nodes))
}

/// `parameters.repl` is a positive integer, default 1.
fn parse_repl_parameter(parameters: &HashMap<String, String>) -> Result<u64, Status> {
    match parameters.get("repl") {
        None => Ok(1),
        Some(value) => match value.parse::<u64>() {
            Ok(count) if count >= 1 => Ok(count),
            _ => Err(Status::invalid_argument(format!(
                "repl parameter must be a positive integer, got {}",
                value
            ))),
        },
    }
}

#[tonic::async_trait]
impl Controller for CsiController {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        let uuid = parse_volume_name(&args.name)?;
        check_capabilities(&args.volume_capabilities)?;
        let (must_nodes, should_nodes) = parse_topology(args.accessibility_requirements)?;
        let replica_count = parse_repl_parameter(&args.parameters)?;

        let (mut required_bytes, limit_bytes) = args
            .capacity_range
            .map(|range| (range.required_bytes.max(0) as u64, range.limit_bytes.max(0) as u64))
            .unwrap_or((0, 0));
        if required_bytes == 0 {
            if limit_bytes == 0 {
                return Err(Status::invalid_argument(
                    "either required_bytes or limit_bytes must be given",
                ));
            }
            required_bytes = limit_bytes;
        }

        let spec = VolumeSpec {
            replica_count,
            required_nodes: must_nodes,
            preferred_nodes: should_nodes,
            required_bytes,
            limit_bytes,
        };
        tracing::info!(
            "Creating volume {} ({} replica(s), {} bytes)",
            uuid,
            spec.replica_count,
            spec.required_bytes
        );
        let volume = self
            .volumes
            .ensure_volume(&uuid, &spec)
            .await
            .map_err(|e| e.to_grpc_status())?;

        if volume.nexus.is_none() {
            return Err(Status::internal(format!("volume {} has no nexus", uuid)));
        }
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Self::volume_to_csi(&volume)),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        // An id we could never have issued cannot name an existing volume.
        let Ok(uuid) = Uuid::parse_str(&args.volume_id) else {
            return Ok(Response::new(DeleteVolumeResponse {}));
        };
        tracing::info!("Deleting volume {}", uuid);
        self.volumes
            .destroy_volume(&uuid)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        let uuid = Uuid::parse_str(&args.volume_id)
            .map_err(|_| Status::not_found(format!("volume {} does not exist", args.volume_id)))?;
        let node_name = parse_node_id(&args.node_id)?;
        if args.readonly {
            return Err(Status::invalid_argument(
                "readonly volumes are not supported",
            ));
        }
        if let Some(capability) = &args.volume_capability {
            check_capabilities(std::slice::from_ref(capability))?;
        }

        let volume = self
            .volumes
            .get_volume(&uuid)
            .await
            .ok_or_else(|| Status::not_found(format!("volume {} does not exist", uuid)))?;
        let nexus = volume
            .nexus
            .as_ref()
            .ok_or_else(|| Status::unavailable(format!("volume {} has no nexus", uuid)))?;
        if nexus.node != node_name {
            return Err(Status::invalid_argument(format!(
                "volume {} is accessible from node {}, not {}",
                uuid, nexus.node, node_name
            )));
        }

        let volume = self
            .volumes
            .publish_volume(&uuid)
            .await
            .map_err(|e| e.to_grpc_status())?;
        let device_uri = volume
            .nexus
            .and_then(|n| n.device_uri)
            .ok_or_else(|| Status::internal("publish reported no device uri"))?;
        tracing::info!("Published volume {} at {}", uuid, device_uri);

        let mut publish_context = HashMap::new();
        publish_context.insert("uri".to_string(), device_uri);
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        let uuid = Uuid::parse_str(&args.volume_id)
            .map_err(|_| Status::not_found(format!("volume {} does not exist", args.volume_id)))?;
        let volume = self
            .volumes
            .get_volume(&uuid)
            .await
            .ok_or_else(|| Status::not_found(format!("volume {} does not exist", uuid)))?;

        // A mismatched node is suspicious but not a reason to keep the
        // device exported.
        if !args.node_id.is_empty() {
            let node_name = parse_node_id(&args.node_id)?;
            if let Some(nexus) = &volume.nexus {
                if nexus.node != node_name {
                    tracing::warn!(
                        "Unpublish of volume {} from node {}, but the nexus is on {}",
                        uuid,
                        node_name,
                        nexus.node
                    );
                }
            }
        }

        self.volumes
            .unpublish_volume(&uuid)
            .await
            .map_err(|e| e.to_grpc_status())?;
        tracing::info!("Unpublished volume {}", uuid);
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        let uuid = Uuid::parse_str(&args.volume_id)
            .map_err(|_| Status::not_found(format!("volume {} does not exist", args.volume_id)))?;
        if self.volumes.get_volume(&uuid).await.is_none() {
            return Err(Status::not_found(format!("volume {} does not exist", uuid)));
        }

        let supported: Vec<VolumeCapability> = args
            .volume_capabilities
            .iter()
            .filter(|c| is_single_node_writer(c))
            .cloned()
            .collect();
        let response = if supported.is_empty() {
            ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "The only supported access mode is SINGLE_NODE_WRITER".to_string(),
            }
        } else {
            ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: HashMap::new(),
                    volume_capabilities: supported,
                    parameters: HashMap::new(),
                }),
                message: String::new(),
            }
        };
        Ok(Response::new(response))
    }

    /// A paginated snapshot over all nexuses. The context of an undrained
    /// first page stays valid for at least a minute.
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        let mut paging = self.paging.lock().await;
        paging.gc();

        let mut entries = if args.starting_token.is_empty() {
            let mut nexuses = self.registry.get_nexuses().await;
            nexuses.sort_by_key(|n| n.uuid);
            nexuses
                .into_iter()
                .map(|nexus| CsiVolume {
                    capacity_bytes: nexus.size as i64,
                    volume_id: nexus.uuid.to_string(),
                    volume_context: HashMap::new(),
                    accessible_topology: vec![hostname_topology(&nexus.node)],
                })
                .collect::<Vec<_>>()
        } else {
            let id: u64 = args
                .starting_token
                .parse()
                .map_err(|_| Status::aborted("starting token is not valid"))?;
            match paging.contexts.remove(&id) {
                Some(context) => context.entries,
                None => return Err(Status::aborted("starting token is no longer valid")),
            }
        };

        let max_entries = args.max_entries.max(0) as usize;
        let page: Vec<list_volumes_response::Entry> = if max_entries == 0 {
            std::mem::take(&mut entries)
        } else {
            entries
                .drain(..max_entries.min(entries.len()))
                .collect::<Vec<_>>()
        }
        .into_iter()
        .map(|volume| list_volumes_response::Entry {
            volume: Some(volume),
        })
        .collect();

        let next_token = if entries.is_empty() {
            String::new()
        } else {
            paging.insert(entries).to_string()
        };
        Ok(Response::new(ListVolumesResponse {
            entries: page,
            next_token,
        }))
    }

    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        self.check_ready()?;
        let args = request.into_inner();

        let node = args
            .accessible_topology
            .and_then(|t| t.segments.get(HOSTNAME_TOPOLOGY_KEY).cloned());
        let capacity = self.registry.get_capacity(node.as_deref()).await;
        tracing::debug!(
            "Capacity of {}: {}",
            node.as_deref().unwrap_or("the fleet"),
            crate::common::format_bytes(capacity)
        );
        Ok(Response::new(GetCapacityResponse {
            available_capacity: capacity as i64,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = [
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::ListVolumes,
            controller_service_capability::rpc::Type::GetCapacity,
        ]
        .into_iter()
        .map(|capability| ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc {
                    r#type: capability as i32,
                },
            )),
        })
        .collect();
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not implemented"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not implemented"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not implemented"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerExpandVolume is not implemented",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi_proto::volume_capability::{AccessMode, AccessType, BlockVolume};
    use crate::csi_proto::TopologyRequirement;

    fn capability(mode: volume_capability::access_mode::Mode) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(AccessType::Block(BlockVolume {})),
            access_mode: Some(AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn test_parse_volume_name() {
        let uuid = parse_volume_name("pvc-753b391c-9b04-4ce3-9c74-9d949152e547").unwrap();
        assert_eq!(uuid.to_string(), "753b391c-9b04-4ce3-9c74-9d949152e547");

        // Prefix, case and shape are all strict.
        assert!(parse_volume_name("753b391c-9b04-4ce3-9c74-9d949152e547").is_err());
        assert!(parse_volume_name("pvc-753B391C-9B04-4CE3-9C74-9D949152E547").is_err());
        assert!(parse_volume_name("pvc-not-a-uuid").is_err());
        assert!(parse_volume_name("pv-753b391c-9b04-4ce3-9c74-9d949152e547").is_err());
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(parse_node_id("mayastor://node-1").unwrap(), "node-1");
        assert!(parse_node_id("node-1").is_err());
        assert!(parse_node_id("mayastor://").is_err());
        assert!(parse_node_id("mayastor://node-1/extra").is_err());
        assert!(parse_node_id("iscsi://node-1").is_err());
    }

    #[test]
    fn test_parse_repl_parameter() {
        assert_eq!(parse_repl_parameter(&HashMap::new()).unwrap(), 1);

        let mut parameters = HashMap::new();
        parameters.insert("repl".to_string(), "3".to_string());
        assert_eq!(parse_repl_parameter(&parameters).unwrap(), 3);

        parameters.insert("repl".to_string(), "0".to_string());
        assert!(parse_repl_parameter(&parameters).is_err());
        parameters.insert("repl".to_string(), "two".to_string());
        assert!(parse_repl_parameter(&parameters).is_err());
    }

    #[test]
    fn test_check_capabilities() {
        use volume_capability::access_mode::Mode;
        assert!(check_capabilities(&[capability(Mode::SingleNodeWriter)]).is_ok());
        assert!(check_capabilities(&[]).is_err());
        assert!(check_capabilities(&[
            capability(Mode::SingleNodeWriter),
            capability(Mode::MultiNodeMultiWriter),
        ])
        .is_err());
    }

    #[test]
    fn test_parse_topology() {
        let mut hostname = HashMap::new();
        hostname.insert(HOSTNAME_TOPOLOGY_KEY.to_string(), "node-1".to_string());
        let mut foreign = HashMap::new();
        foreign.insert("topology.kubernetes.io/zone".to_string(), "z1".to_string());

        // Foreign keys on the requisite list are rejected.
        let requirement = TopologyRequirement {
            requisite: vec![Topology {
                segments: foreign.clone(),
            }],
            preferred: vec![],
        };
        assert!(parse_topology(Some(requirement)).is_err());

        // On the preferred list they are silently ignored.
        let requirement = TopologyRequirement {
            requisite: vec![Topology {
                segments: hostname.clone(),
            }],
            preferred: vec![
                Topology { segments: foreign },
                Topology { segments: hostname },
            ],
        };
        let (must, should) = parse_topology(Some(requirement)).unwrap();
        assert_eq!(must, vec!["node-1".to_string()]);
        assert_eq!(should, vec!["node-1".to_string()]);

        assert_eq!(parse_topology(None).unwrap(), (vec![], vec![]));
    }
}
