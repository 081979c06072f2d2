//! RPC session to one storage node.
//!
//! One channel per endpoint, re-established by the owning
//! [`Node`](crate::core::node::Node) on failure. Every call carries the
//! configured deadline; status codes are classified into
//! [`Error`](crate::Error) variants so `NOT_FOUND` and `ALREADY_EXISTS`
//! stay distinguishable from generic failures.

use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::proto;
use crate::proto::mayastor_client::MayastorClient;

pub struct NodeClient {
    endpoint: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    client: Mutex<Option<MayastorClient<Channel>>>,
}

impl NodeClient {
    /// `endpoint` is `host:port` for TCP or an absolute path for UDS.
    pub fn new(endpoint: String, request_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            request_timeout,
            connect_timeout,
            client: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Establish the channel. Idempotent; an existing channel is replaced.
    pub async fn connect(&self) -> Result<()> {
        let channel = if self.endpoint.starts_with('/') {
            self.connect_uds().await
        } else {
            self.connect_tcp().await
        }
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", self.endpoint, e)))?;

        *self.client.lock().await = Some(MayastorClient::new(channel));
        Ok(())
    }

    async fn connect_tcp(&self) -> std::result::Result<Channel, tonic::transport::Error> {
        Endpoint::from_shared(format!("http://{}", self.endpoint))?
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
    }

    async fn connect_uds(&self) -> std::result::Result<Channel, tonic::transport::Error> {
        let path = self.endpoint.clone();
        // The uri is required by the builder but never resolved.
        Endpoint::try_from("http://[::]:50051")?
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await
    }

    pub async fn disconnect(&self) {
        *self.client.lock().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn client(&self) -> Result<MayastorClient<Channel>> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Unavailable(format!("node {} is not connected", self.endpoint)))
    }

    // === Pools ===

    pub async fn list_pools(&self) -> Result<Vec<proto::Pool>> {
        let mut client = self.client().await?;
        let reply = client.list_pools(proto::Null {}).await?;
        Ok(reply.into_inner().pools)
    }

    pub async fn create_pool(&self, name: &str, disks: Vec<String>) -> Result<()> {
        let mut client = self.client().await?;
        client
            .create_pool(proto::CreatePoolRequest {
                name: name.to_string(),
                disks,
            })
            .await?;
        Ok(())
    }

    pub async fn destroy_pool(&self, name: &str) -> Result<()> {
        let mut client = self.client().await?;
        client
            .destroy_pool(proto::DestroyPoolRequest {
                name: name.to_string(),
            })
            .await?;
        Ok(())
    }

    // === Replicas ===

    pub async fn list_replicas(&self) -> Result<Vec<proto::Replica>> {
        let mut client = self.client().await?;
        let reply = client.list_replicas(proto::Null {}).await?;
        Ok(reply.into_inner().replicas)
    }

    /// Returns the access URI of the new replica.
    pub async fn create_replica(
        &self,
        uuid: &Uuid,
        pool: &str,
        size: u64,
        thin: bool,
        share: proto::ShareProtocolReplica,
    ) -> Result<String> {
        let mut client = self.client().await?;
        let reply = client
            .create_replica(proto::CreateReplicaRequest {
                uuid: uuid.to_string(),
                pool: pool.to_string(),
                size,
                thin,
                share: share as i32,
            })
            .await?;
        Ok(reply.into_inner().uri)
    }

    pub async fn destroy_replica(&self, uuid: &Uuid) -> Result<()> {
        let mut client = self.client().await?;
        client
            .destroy_replica(proto::DestroyReplicaRequest {
                uuid: uuid.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Returns the access URI after the share change.
    pub async fn share_replica(
        &self,
        uuid: &Uuid,
        share: proto::ShareProtocolReplica,
    ) -> Result<String> {
        let mut client = self.client().await?;
        let reply = client
            .share_replica(proto::ShareReplicaRequest {
                uuid: uuid.to_string(),
                share: share as i32,
            })
            .await?;
        Ok(reply.into_inner().uri)
    }

    // === Nexus ===

    pub async fn list_nexus(&self) -> Result<Vec<proto::Nexus>> {
        let mut client = self.client().await?;
        let reply = client.list_nexus(proto::Null {}).await?;
        Ok(reply.into_inner().nexus_list)
    }

    pub async fn create_nexus(&self, uuid: &Uuid, size: u64, children: Vec<String>) -> Result<()> {
        let mut client = self.client().await?;
        client
            .create_nexus(proto::CreateNexusRequest {
                uuid: uuid.to_string(),
                size,
                children,
            })
            .await?;
        Ok(())
    }

    pub async fn destroy_nexus(&self, uuid: &Uuid) -> Result<()> {
        let mut client = self.client().await?;
        client
            .destroy_nexus(proto::DestroyNexusRequest {
                uuid: uuid.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn add_child_nexus(&self, uuid: &Uuid, uri: &str) -> Result<()> {
        let mut client = self.client().await?;
        client
            .add_child_nexus(proto::AddChildNexusRequest {
                uuid: uuid.to_string(),
                uri: uri.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn remove_child_nexus(&self, uuid: &Uuid, uri: &str) -> Result<()> {
        let mut client = self.client().await?;
        client
            .remove_child_nexus(proto::RemoveChildNexusRequest {
                uuid: uuid.to_string(),
                uri: uri.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Returns the block-device URI the nexus is now published at.
    pub async fn publish_nexus(
        &self,
        uuid: &Uuid,
        share: proto::ShareProtocolNexus,
    ) -> Result<String> {
        let mut client = self.client().await?;
        let reply = client
            .publish_nexus(proto::PublishNexusRequest {
                uuid: uuid.to_string(),
                // No encryption key; the field exists on the wire.
                key: String::new(),
                share: share as i32,
            })
            .await?;
        Ok(reply.into_inner().device_uri)
    }

    pub async fn unpublish_nexus(&self, uuid: &Uuid) -> Result<()> {
        let mut client = self.client().await?;
        client
            .unpublish_nexus(proto::UnpublishNexusRequest {
                uuid: uuid.to_string(),
            })
            .await?;
        Ok(())
    }
}
