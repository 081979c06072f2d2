//! CSI server: the Identity and Controller services on a Unix domain
//! socket.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use crate::common::Result;
use crate::core::registry::Registry;
use crate::core::volumes::VolumeManager;
use crate::csi::controller::CsiController;
use crate::csi::identity::CsiIdentity;

pub struct CsiServer {
    socket_path: PathBuf,
    registry: Arc<Registry>,
    volumes: Arc<VolumeManager>,
    ready: Arc<AtomicBool>,
}

impl CsiServer {
    pub fn new(socket_path: PathBuf, registry: Arc<Registry>, volumes: Arc<VolumeManager>) -> Self {
        Self {
            socket_path,
            registry,
            volumes,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Until this is flipped, every controller RPC replies `UNAVAILABLE`;
    /// identity RPCs are served regardless.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub async fn serve(&self) -> Result<()> {
        // Remove a stale socket left by a previous instance.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::info!(
                "Removed stale CSI socket {}",
                self.socket_path.display()
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("CSI server bound to {}", self.socket_path.display());

        let identity = CsiIdentity::new(self.ready.clone());
        let controller = CsiController::new(
            self.registry.clone(),
            self.volumes.clone(),
            self.ready.clone(),
        );

        Server::builder()
            .add_service(identity.into_server())
            .add_service(controller.into_server())
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await?;
        Ok(())
    }
}
