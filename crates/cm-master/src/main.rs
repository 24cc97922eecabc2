//! Cluster master daemon
//!
//! Serves gRPC and HTTP on one port and recovers the previous process's
//! experiments on startup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cm_core::config::{self, MasterConfig};
use cm_core::{ClusterStore, SnapshotStore};
use cm_master::error::{MasterError, TransportError};
use cm_master::transport::Activation;
use cm_master::{LogBuffer, Master};

#[derive(Parser)]
#[command(name = "cm-master")]
#[command(about = "Cluster master daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CM_MASTER_CONFIG")]
    config: Option<PathBuf>,

    /// Port to bind when no listener is inherited (overrides config)
    #[arg(short, long, env = "CM_MASTER_PORT")]
    port: Option<u16>,

    /// Cluster state file (overrides config)
    #[arg(long, env = "CM_MASTER_STORAGE")]
    storage: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    // the environment is edited here, while this is the only thread
    let activation = Activation::from_env().context("Failed to read socket activation")?;
    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?
        .block_on(run(args, activation))
}

async fn run(args: Args, activation: Activation) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(storage) = args.storage {
        config.storage.path = Some(storage);
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    tracing::info!("Cluster master starting...");

    let store: Arc<dyn ClusterStore> = match &config.storage.path {
        Some(path) => Arc::new(
            SnapshotStore::open(path)
                .with_context(|| format!("Failed to open cluster store at {:?}", path))?,
        ),
        None => {
            tracing::warn!("No storage path configured, cluster state will not survive a restart");
            Arc::new(SnapshotStore::in_memory())
        }
    };

    if !activation.fds().is_empty() {
        tracing::info!("Inherited {} listening socket(s)", activation.fds().len());
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let result = Master::new(config, store)
        .with_activation(activation)
        .with_log_buffer(logs)
        .run(cancel)
        .await;

    match result {
        Ok(()) | Err(MasterError::Transport(TransportError::Cancelled)) => {
            tracing::info!("Master shutdown complete");
            Ok(())
        }
        Err(e) => Err(e).context("Master exited"),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MasterConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    config::load_config_or_default(&default_path)
        .with_context(|| format!("Failed to load config from {:?}", default_path))
}
