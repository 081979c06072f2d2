//! CSI Identity service: plugin discovery and health.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::csi_proto::identity_server::{Identity, IdentityServer};
use crate::csi_proto::{
    plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

pub struct CsiIdentity {
    ready: Arc<AtomicBool>,
}

impl CsiIdentity {
    pub fn new(ready: Arc<AtomicBool>) -> Self {
        Self { ready }
    }

    pub fn into_server(self) -> IdentityServer<Self> {
        IdentityServer::new(self)
    }

    fn capability(capability: plugin_capability::service::Type) -> PluginCapability {
        PluginCapability {
            r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                r#type: capability as i32,
            })),
        }
    }
}

#[tonic::async_trait]
impl Identity for CsiIdentity {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: crate::PLUGIN_NAME.to_string(),
            vendor_version: crate::VERSION.to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: vec![
                Self::capability(plugin_capability::service::Type::ControllerService),
                Self::capability(plugin_capability::service::Type::VolumeAccessibilityConstraints),
            ],
        }))
    }

    /// Identity RPCs are served even before the controller is ready; the
    /// readiness is what `Probe` reports.
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse {
            ready: self.ready.load(Ordering::Relaxed),
        }))
    }
}
