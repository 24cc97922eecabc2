//! Global master state

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use cm_core::config::MasterConfig;
use cm_core::ClusterStore;

use crate::allocation::AllocationRegistry;
use crate::api::TaskLogBackend;
use crate::logs::LogBuffer;
use crate::supervision::ExperimentRegistry;

/// Shared state for the master daemon
pub struct MasterState {
    /// Effective configuration, with the resolved port
    pub config: MasterConfig,
    /// Cluster id, stable across restarts
    pub cluster_id: String,
    /// Id of this master process
    pub master_id: Uuid,
    /// Persistence
    pub store: Arc<dyn ClusterStore>,
    /// Supervised experiments
    pub experiments: Arc<ExperimentRegistry>,
    /// Live allocations
    pub allocations: Arc<AllocationRegistry>,
    /// Task log destination
    pub task_logs: TaskLogBackend,
    /// Recent master log lines
    pub logs: LogBuffer,
    ready: watch::Sender<bool>,
}

impl MasterState {
    /// Create state for a master that has not finished recovery
    pub fn new(
        config: MasterConfig,
        cluster_id: String,
        store: Arc<dyn ClusterStore>,
        experiments: Arc<ExperimentRegistry>,
        allocations: Arc<AllocationRegistry>,
    ) -> Self {
        let task_logs = TaskLogBackend::from_config(&config.task_logs, Arc::clone(&store));
        let (ready, _) = watch::channel(false);
        Self {
            config,
            cluster_id,
            master_id: Uuid::new_v4(),
            store,
            experiments,
            allocations,
            task_logs,
            logs: LogBuffer::default(),
            ready,
        }
    }

    /// Serve log lines captured into `logs`
    pub fn with_logs(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }

    /// Open scheduling-affecting routes
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Whether recovery and reconciliation are complete
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}
