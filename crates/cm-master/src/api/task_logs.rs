//! Task log backends

use std::sync::Arc;

use cm_core::config::TaskLogConfig;
use cm_core::store::TaskLog;
use cm_core::{ClusterStore, StoreError};

/// Destination for task logs shipped to the master
#[derive(Clone)]
pub enum TaskLogBackend {
    /// Write through the cluster store
    Store(Arc<dyn ClusterStore>),
    /// Emit each line as a tracing event
    Tracing,
}

impl TaskLogBackend {
    /// Build the configured backend
    pub fn from_config(config: &TaskLogConfig, store: Arc<dyn ClusterStore>) -> Self {
        match config {
            TaskLogConfig::Store => Self::Store(store),
            TaskLogConfig::Tracing => Self::Tracing,
        }
    }

    /// Backend name as it appears in configuration
    pub fn name(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Tracing => "tracing",
        }
    }

    /// Record a batch of log lines
    pub async fn add_task_logs(&self, logs: Vec<TaskLog>) -> Result<(), StoreError> {
        match self {
            Self::Store(store) => store.add_task_logs(logs).await,
            Self::Tracing => {
                for log in logs {
                    tracing::info!(
                        target: "task_logs",
                        task_id = %log.task_id,
                        log_level = log.level.as_deref().unwrap_or("INFO"),
                        "{}",
                        log.log
                    );
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for TaskLogBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
