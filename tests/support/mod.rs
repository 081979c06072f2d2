//! Test support: an in-process mock storage node implementing the
//! `Mayastor` service over loopback gRPC, plus a harness wiring mock nodes,
//! the registry, the volume manager and the CSI server together.

// Not every test file uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blockplane::common::PublishProtocol;
use blockplane::core::node::NodeOptions;
use blockplane::core::{Registry, VolumeManager};
use blockplane::csi::CsiServer;
use blockplane::proto::mayastor_server::{Mayastor, MayastorServer};
use blockplane::proto::*;
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;

#[derive(Debug, Default)]
pub struct MockNodeState {
    pub pools: HashMap<String, Pool>,
    pub replicas: HashMap<String, Replica>,
    pub nexuses: HashMap<String, Nexus>,
}

/// One fake storage node. State is shared with the test for assertions.
#[derive(Clone)]
pub struct MockNode {
    name: String,
    state: Arc<Mutex<MockNodeState>>,
}

impl MockNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockNodeState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_pool(&self, name: &str, capacity: u64, used: u64) {
        self.add_pool_with_state(name, capacity, used, PoolState::PoolOnline);
    }

    pub fn add_pool_with_state(&self, name: &str, capacity: u64, used: u64, state: PoolState) {
        let mut locked = self.state.lock().unwrap();
        locked.pools.insert(
            name.to_string(),
            Pool {
                name: name.to_string(),
                disks: vec!["/dev/vda".to_string()],
                state: state as i32,
                capacity,
                used,
            },
        );
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockNodeState> {
        self.state.lock().unwrap()
    }

    fn nvmf_uri(&self, uuid: &str) -> String {
        format!("nvmf://{}:8420/nqn.2019-05.io.openebs:{}", self.name, uuid)
    }

    /// Serve on an ephemeral loopback port; returns the bound address.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = MayastorServer::new(self.clone());
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });
        addr
    }
}

#[tonic::async_trait]
impl Mayastor for MockNode {
    async fn create_pool(&self, request: Request<CreatePoolRequest>) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        if state.pools.contains_key(&args.name) {
            return Err(Status::already_exists(format!("pool {} exists", args.name)));
        }
        state.pools.insert(
            args.name.clone(),
            Pool {
                name: args.name,
                disks: args.disks,
                state: PoolState::PoolOnline as i32,
                capacity: 100 * 1024 * 1024 * 1024,
                used: 0,
            },
        );
        Ok(Response::new(Null {}))
    }

    async fn destroy_pool(&self, request: Request<DestroyPoolRequest>) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        if state.pools.remove(&args.name).is_none() {
            return Err(Status::not_found(format!("pool {} does not exist", args.name)));
        }
        state.replicas.retain(|_, r| r.pool != args.name);
        Ok(Response::new(Null {}))
    }

    async fn list_pools(&self, _request: Request<Null>) -> Result<Response<ListPoolsReply>, Status> {
        let state = self.state.lock().unwrap();
        Ok(Response::new(ListPoolsReply {
            pools: state.pools.values().cloned().collect(),
        }))
    }

    async fn create_replica(
        &self,
        request: Request<CreateReplicaRequest>,
    ) -> Result<Response<CreateReplicaReply>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.replicas.get(&args.uuid) {
            if existing.pool == args.pool {
                return Err(Status::already_exists(format!("replica {} exists", args.uuid)));
            }
            return Err(Status::already_exists(format!(
                "replica {} exists on another pool",
                args.uuid
            )));
        }
        let pool = state
            .pools
            .get_mut(&args.pool)
            .ok_or_else(|| Status::not_found(format!("pool {} does not exist", args.pool)))?;
        if pool.capacity - pool.used < args.size {
            return Err(Status::resource_exhausted(format!(
                "pool {} has no space for {} bytes",
                args.pool, args.size
            )));
        }
        pool.used += args.size;
        let uri = format!("bdev:///{}", args.uuid);
        state.replicas.insert(
            args.uuid.clone(),
            Replica {
                uuid: args.uuid,
                pool: args.pool,
                size: args.size,
                thin: args.thin,
                share: args.share,
                uri: uri.clone(),
                state: ReplicaState::ReplicaOnline as i32,
            },
        );
        Ok(Response::new(CreateReplicaReply { uri }))
    }

    async fn destroy_replica(
        &self,
        request: Request<DestroyReplicaRequest>,
    ) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        let replica = state
            .replicas
            .remove(&args.uuid)
            .ok_or_else(|| Status::not_found(format!("replica {} does not exist", args.uuid)))?;
        if let Some(pool) = state.pools.get_mut(&replica.pool) {
            pool.used = pool.used.saturating_sub(replica.size);
        }
        Ok(Response::new(Null {}))
    }

    async fn list_replicas(&self, _request: Request<Null>) -> Result<Response<ListReplicasReply>, Status> {
        let state = self.state.lock().unwrap();
        Ok(Response::new(ListReplicasReply {
            replicas: state.replicas.values().cloned().collect(),
        }))
    }

    async fn share_replica(
        &self,
        request: Request<ShareReplicaRequest>,
    ) -> Result<Response<ShareReplicaReply>, Status> {
        let args = request.into_inner();
        let uri = match args.share() {
            ShareProtocolReplica::ReplicaNone => format!("bdev:///{}", args.uuid),
            ShareProtocolReplica::ReplicaNvmf => self.nvmf_uri(&args.uuid),
            ShareProtocolReplica::ReplicaIscsi => {
                format!("iscsi://{}:3260/iqn.2019-05.io.openebs:{}", self.name, args.uuid)
            }
        };
        let mut state = self.state.lock().unwrap();
        let replica = state
            .replicas
            .get_mut(&args.uuid)
            .ok_or_else(|| Status::not_found(format!("replica {} does not exist", args.uuid)))?;
        replica.share = args.share;
        replica.uri = uri.clone();
        Ok(Response::new(ShareReplicaReply { uri }))
    }

    async fn create_nexus(&self, request: Request<CreateNexusRequest>) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        if state.nexuses.contains_key(&args.uuid) {
            return Err(Status::already_exists(format!("nexus {} exists", args.uuid)));
        }
        state.nexuses.insert(
            args.uuid.clone(),
            Nexus {
                uuid: args.uuid,
                size: args.size,
                state: NexusState::NexusOnline as i32,
                children: args
                    .children
                    .into_iter()
                    .map(|uri| Child {
                        uri,
                        state: ChildState::ChildOnline as i32,
                    })
                    .collect(),
                device_uri: String::new(),
            },
        );
        Ok(Response::new(Null {}))
    }

    async fn destroy_nexus(&self, request: Request<DestroyNexusRequest>) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        if state.nexuses.remove(&args.uuid).is_none() {
            return Err(Status::not_found(format!("nexus {} does not exist", args.uuid)));
        }
        Ok(Response::new(Null {}))
    }

    async fn list_nexus(&self, _request: Request<Null>) -> Result<Response<ListNexusReply>, Status> {
        let state = self.state.lock().unwrap();
        Ok(Response::new(ListNexusReply {
            nexus_list: state.nexuses.values().cloned().collect(),
        }))
    }

    async fn add_child_nexus(
        &self,
        request: Request<AddChildNexusRequest>,
    ) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        let nexus = state
            .nexuses
            .get_mut(&args.uuid)
            .ok_or_else(|| Status::not_found(format!("nexus {} does not exist", args.uuid)))?;
        if nexus.children.iter().any(|c| c.uri == args.uri) {
            return Err(Status::already_exists(format!("child {} exists", args.uri)));
        }
        nexus.children.push(Child {
            uri: args.uri,
            state: ChildState::ChildOnline as i32,
        });
        Ok(Response::new(Null {}))
    }

    async fn remove_child_nexus(
        &self,
        request: Request<RemoveChildNexusRequest>,
    ) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        let nexus = state
            .nexuses
            .get_mut(&args.uuid)
            .ok_or_else(|| Status::not_found(format!("nexus {} does not exist", args.uuid)))?;
        let before = nexus.children.len();
        nexus.children.retain(|c| c.uri != args.uri);
        if nexus.children.len() == before {
            return Err(Status::not_found(format!("child {} does not exist", args.uri)));
        }
        Ok(Response::new(Null {}))
    }

    async fn publish_nexus(
        &self,
        request: Request<PublishNexusRequest>,
    ) -> Result<Response<PublishNexusReply>, Status> {
        let args = request.into_inner();
        let device_uri = format!("nvmf://{}:8420/nexus-{}", self.name, args.uuid);
        let mut state = self.state.lock().unwrap();
        let nexus = state
            .nexuses
            .get_mut(&args.uuid)
            .ok_or_else(|| Status::not_found(format!("nexus {} does not exist", args.uuid)))?;
        if !nexus.device_uri.is_empty() {
            return Err(Status::already_exists(format!("nexus {} is published", args.uuid)));
        }
        nexus.device_uri = device_uri.clone();
        Ok(Response::new(PublishNexusReply { device_uri }))
    }

    async fn unpublish_nexus(
        &self,
        request: Request<UnpublishNexusRequest>,
    ) -> Result<Response<Null>, Status> {
        let args = request.into_inner();
        let mut state = self.state.lock().unwrap();
        let nexus = state
            .nexuses
            .get_mut(&args.uuid)
            .ok_or_else(|| Status::not_found(format!("nexus {} does not exist", args.uuid)))?;
        nexus.device_uri = String::new();
        Ok(Response::new(Null {}))
    }
}

/// A control plane wired to a set of mock nodes, with the CSI services on a
/// scratch Unix socket.
pub struct TestCluster {
    pub registry: Arc<Registry>,
    pub volumes: Arc<VolumeManager>,
    pub nodes: HashMap<String, MockNode>,
    pub csi_socket: PathBuf,
    _scratch: TempDir,
}

pub async fn start_cluster(mocks: Vec<MockNode>) -> TestCluster {
    start_cluster_opts(mocks, true).await
}

pub async fn start_cluster_opts(mocks: Vec<MockNode>, ready: bool) -> TestCluster {
    let registry = Registry::new(NodeOptions {
        sync_interval: Duration::from_millis(200),
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        backoff_floor: Duration::from_millis(100),
        backoff_cap: Duration::from_millis(500),
    });
    let volumes = VolumeManager::new(
        registry.clone(),
        PublishProtocol::Nvmf,
        Duration::from_millis(500),
    );
    volumes.spawn();

    let mut nodes = HashMap::new();
    let expected_pools: usize = mocks.iter().map(|m| m.state().pools.len()).sum();
    for mock in mocks {
        let addr = mock.serve().await;
        registry.add_node(&mock.name, &addr.to_string()).await;
        nodes.insert(mock.name.clone(), mock);
    }

    let scratch = TempDir::new().unwrap();
    let csi_socket = scratch.path().join("csi.sock");
    let csi = CsiServer::new(csi_socket.clone(), registry.clone(), volumes.clone());
    csi.set_ready(ready);
    tokio::spawn(async move {
        let _ = csi.serve().await;
    });

    wait_for(|| {
        let csi_socket = csi_socket.clone();
        async move { csi_socket.exists() }
    })
    .await;
    let cluster = TestCluster {
        registry,
        volumes,
        nodes,
        csi_socket,
        _scratch: scratch,
    };
    cluster.wait_for_pools(expected_pools).await;
    cluster
}

impl TestCluster {
    /// Poll until the registry has discovered `count` pools.
    pub async fn wait_for_pools(&self, count: usize) {
        let registry = self.registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            async move { registry.get_pools().await.len() >= count }
        })
        .await;
    }

    /// A CSI client channel over the Unix socket.
    pub async fn csi_channel(&self) -> Channel {
        let path = self.csi_socket.clone();
        Endpoint::try_from("http://[::]:50051")
            .unwrap()
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(
                        tokio::net::UnixStream::connect(path).await?,
                    ))
                }
            }))
            .await
            .unwrap()
    }

    /// The mock that currently hosts the nexus of `uuid`, if any.
    pub fn nexus_host(&self, uuid: &str) -> Option<&MockNode> {
        self.nodes
            .values()
            .find(|mock| mock.state().nexuses.contains_key(uuid))
    }
}

pub fn snw_capability() -> blockplane::csi_proto::VolumeCapability {
    use blockplane::csi_proto::volume_capability::{access_mode, AccessMode, AccessType, MountVolume};
    blockplane::csi_proto::VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: "ext4".to_string(),
            mount_flags: vec![],
        })),
        access_mode: Some(AccessMode {
            mode: access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

pub fn create_volume_request(
    name: &str,
    required_bytes: i64,
    limit_bytes: i64,
    repl: Option<u64>,
) -> blockplane::csi_proto::CreateVolumeRequest {
    let mut parameters = HashMap::new();
    if let Some(repl) = repl {
        parameters.insert("repl".to_string(), repl.to_string());
    }
    blockplane::csi_proto::CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(blockplane::csi_proto::CapacityRange {
            required_bytes,
            limit_bytes,
        }),
        volume_capabilities: vec![snw_capability()],
        parameters,
        accessibility_requirements: None,
    }
}

pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}
