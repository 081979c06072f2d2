//! Control-plane daemon

use std::path::PathBuf;

use blockplane::common::{Config, NodeConfig};
use blockplane::core::node::NodeOptions;
use blockplane::core::{Registry, VolumeManager};
use blockplane::csi::CsiServer;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blockplane-control")]
#[command(about = "Control plane for the blockplane block-storage provisioner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane
    Serve {
        /// CSI socket path
        #[arg(long)]
        csi_socket: Option<PathBuf>,

        /// Storage node as name=endpoint (repeatable)
        #[arg(long = "node")]
        nodes: Vec<NodeConfig>,

        /// Per-node sync interval in seconds
        #[arg(long)]
        sync_interval: Option<u64>,

        /// Config file (JSON); CLI flags take priority
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log level
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            csi_socket,
            nodes,
            sync_interval,
            config,
            log_level,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(path)?,
                None => Config::default(),
            };
            if let Some(path) = csi_socket {
                config.csi_socket = path;
            }
            if !nodes.is_empty() {
                config.nodes = nodes;
            }
            if let Some(secs) = sync_interval {
                config.sync_interval_secs = secs;
            }
            if let Some(level) = log_level {
                config.log_level = level;
            }
            config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            serve(config).await
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting blockplane control plane v{}", blockplane::VERSION);
    tracing::info!("  CSI socket: {}", config.csi_socket.display());
    tracing::info!("  Registered nodes: {}", config.nodes.len());
    tracing::info!("  Sync interval: {}s", config.sync_interval_secs);

    let (backoff_floor, backoff_cap) = config.reconnect_backoff();
    let registry = Registry::new(NodeOptions {
        sync_interval: config.sync_interval(),
        request_timeout: config.request_timeout(),
        connect_timeout: config.connect_timeout(),
        backoff_floor,
        backoff_cap,
    });

    let volumes = VolumeManager::new(
        registry.clone(),
        config.publish_protocol,
        config.reconcile_interval(),
    );
    volumes.spawn();

    for node in &config.nodes {
        registry.add_node(&node.name, &node.endpoint).await;
    }

    let csi = CsiServer::new(config.csi_socket.clone(), registry.clone(), volumes.clone());
    // Controller RPCs stay UNAVAILABLE until the fleet is registered.
    csi.set_ready(true);
    tracing::info!("✓ Control plane ready");

    tokio::select! {
        res = csi.serve() => {
            if let Err(e) = res {
                tracing::error!("CSI server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
