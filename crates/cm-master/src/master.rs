//! Master bootstrap
//!
//! [`Master::bind`] does everything that can fail on bad configuration
//! before any server starts: config validation, TLS material and listener
//! resolution. [`BoundMaster::run`] then starts the transport and runs
//! restart recovery alongside it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tonic_health::ServingStatus;

use cm_core::config::MasterConfig;
use cm_core::ClusterStore;

use crate::allocation::AllocationRegistry;
use crate::api;
use crate::error::MasterError;
use crate::logs::LogBuffer;
use crate::recovery::{recover, RecoveryPlan};
use crate::state::MasterState;
use crate::supervision::{AgentDirectory, ExperimentRegistry, Supervisor};
use crate::transport::{
    acceptor_from_config, resolve_listener, Activation, Demux, SecureListener,
    TransportSupervisor,
};

/// Master process before its listener is resolved
pub struct Master {
    config: MasterConfig,
    store: Arc<dyn ClusterStore>,
    activation: Activation,
    logs: LogBuffer,
}

impl Master {
    /// Create a master that binds `config.port`
    pub fn new(config: MasterConfig, store: Arc<dyn ClusterStore>) -> Self {
        Self {
            config,
            store,
            activation: Activation::none(),
            logs: LogBuffer::default(),
        }
    }

    /// Use descriptors inherited through socket activation
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Serve lines captured by this buffer's tracing layer on `GET /logs`
    pub fn with_log_buffer(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }

    /// Validate configuration and resolve the listener
    pub async fn bind(self) -> Result<BoundMaster, MasterError> {
        let Self {
            mut config,
            store,
            activation,
            logs,
        } = self;

        config.validate()?;

        let cluster_id = store.get_or_create_cluster_id().await?;
        let last_heartbeat = store.last_cluster_heartbeat().await?;
        tracing::info!("Cluster id: {}", cluster_id);

        let tls = acceptor_from_config(&config.security.tls, &config.resource_manager.agent)?;
        let base = resolve_listener(&activation, config.port).await?;
        config.port = base.port();
        let listener = SecureListener::new(base, tls);

        tracing::info!(
            "Master listening on port {} ({})",
            config.port,
            if listener.is_tls() { "TLS" } else { "plaintext" }
        );

        Ok(BoundMaster {
            config,
            store,
            listener,
            cluster_id,
            last_heartbeat,
            logs,
        })
    }

    /// Bind and run until the transport exits or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<(), MasterError> {
        self.bind().await?.run(cancel).await
    }
}

/// Master process holding its listener
pub struct BoundMaster {
    config: MasterConfig,
    store: Arc<dyn ClusterStore>,
    listener: SecureListener,
    cluster_id: String,
    last_heartbeat: Option<DateTime<Utc>>,
    logs: LogBuffer,
}

impl BoundMaster {
    /// Effective port
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Effective configuration
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Serve RPC and HTTP on the shared listener and recover previous work
    ///
    /// Scheduling-affecting requests are refused until recovery and
    /// reconciliation are complete. The first serving loop to exit ends the
    /// run; cancellation ends it with [`crate::error::TransportError::Cancelled`].
    pub async fn run(self, cancel: CancellationToken) -> Result<(), MasterError> {
        let Self {
            config,
            store,
            listener,
            cluster_id,
            last_heartbeat,
            logs,
        } = self;

        let allocations = Arc::new(AllocationRegistry::new());
        let agents = AgentDirectory::load(store.as_ref()).await?;
        let experiments = Arc::new(ExperimentRegistry::new(
            Arc::clone(&store),
            Arc::clone(&allocations),
            agents,
            config.recovery.restore_timeout,
        ));
        let state = Arc::new(MasterState::new(
            config.clone(),
            cluster_id,
            Arc::clone(&store),
            Arc::clone(&experiments),
            Arc::clone(&allocations),
        )
        .with_logs(logs));

        let (mut health, health_service) = tonic_health::server::health_reporter();
        health
            .set_service_status("", ServingStatus::NotServing)
            .await;

        let (demux, routes) = Demux::new(listener, config.mux.sniff_timeout);
        let rpc_server = tonic::transport::Server::builder()
            .add_service(health_service)
            .serve_with_incoming(routes.rpc.into_incoming());
        let http_server = api::serve(routes.http, api::router(Arc::clone(&state)));

        let serving = TransportSupervisor::new()
            .with_loop("gRPC server", rpc_server)
            .with_loop("HTTP server", http_server)
            .with_loop("demultiplexer", demux.serve())
            .run(cancel.clone());
        tokio::pin!(serving);

        let heartbeat_cancel = cancel.child_token();
        let plan = RecoveryPlan {
            max_concurrent_restores: config.recovery.max_concurrent_restores,
            heartbeat_interval: config.cluster_heartbeat_interval,
            last_heartbeat,
        };
        let recovery = recover(
            Arc::clone(&store),
            Arc::clone(&experiments) as Arc<dyn Supervisor>,
            Arc::clone(&allocations),
            plan,
            heartbeat_cancel.clone(),
        );

        let heartbeat = tokio::select! {
            result = &mut serving => {
                tracing::warn!("Transport exited before recovery finished");
                shut_down(&experiments, &allocations);
                return result.map_err(MasterError::from);
            }
            recovered = recovery => match recovered {
                Ok(outcome) => {
                    tracing::info!(
                        "Recovery complete: {} restored, {} failed, {} dangling allocations closed",
                        outcome.restores.restored.len(),
                        outcome.restores.failed.len(),
                        outcome.reconciled.closed.len()
                    );
                    outcome.heartbeat
                }
                Err(e) => {
                    tracing::error!("Recovery failed: {}", e);
                    shut_down(&experiments, &allocations);
                    return Err(e.into());
                }
            }
        };

        state.mark_ready();
        health
            .set_service_status("", ServingStatus::Serving)
            .await;
        tracing::info!("Master ready");

        let result = serving.await;

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!("Heartbeat task ended abnormally: {}", e);
        }
        shut_down(&experiments, &allocations);

        result.map_err(MasterError::from)
    }
}

fn shut_down(experiments: &ExperimentRegistry, allocations: &AllocationRegistry) {
    experiments.shutdown();
    allocations.teardown();
}
