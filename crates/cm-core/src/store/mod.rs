//! Cluster persistence
//!
//! [`ClusterStore`] is the only way the master touches durable state. The
//! recovery path relies on it to find experiments that were running when the
//! previous process died and to close out records nobody owns anymore.

mod snapshot;

pub use snapshot::{ClusterSnapshot, SnapshotStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{AgentId, AllocationId, ExperimentId, RunState, TaskId};

/// Persisted experiment row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub state: RunState,
    /// Experiment configuration as submitted by the user
    pub config: serde_json::Value,
    pub owner: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    /// Create an active experiment record started now
    pub fn active(id: ExperimentId, config: serde_json::Value) -> Self {
        Self {
            id,
            state: RunState::Active,
            config,
            owner: "admin".to_string(),
            start_time: crate::time::now_millis(),
            end_time: None,
        }
    }
}

/// Persisted allocation row
///
/// An allocation is open while `end_time` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: AllocationId,
    pub experiment_id: ExperimentId,
    pub task_id: TaskId,
    pub slots: u32,
    /// Agent and container the allocation was running on, if it got that far
    pub agent_id: Option<AgentId>,
    pub container_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AllocationRecord {
    /// Create an open allocation placed on the given agent container
    pub fn open(
        id: impl Into<AllocationId>,
        experiment_id: ExperimentId,
        placement: Option<(AgentId, String)>,
    ) -> Self {
        let id = id.into();
        let (agent_id, container_id) = match placement {
            Some((agent, container)) => (Some(agent), Some(container)),
            None => (None, None),
        };
        Self {
            task_id: TaskId::new(format!("task-{}", id)),
            id,
            experiment_id,
            slots: 1,
            agent_id,
            container_id,
            start_time: crate::time::now_millis(),
            end_time: None,
        }
    }

    /// Whether the allocation is still open
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Container an agent reported before the previous master stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub agent_id: AgentId,
    pub container_id: String,
}

/// Kind of aggregate usage statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    /// Per-task usage
    Task,
    /// Per-agent uptime
    Agent,
    /// Per-cloud-instance uptime
    Instance,
}

/// Open-ended usage statistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub kind: StatsKind,
    /// Task, agent or instance the record is about
    pub subject: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// One line of task output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: TaskId,
    #[serde(default)]
    pub allocation_id: Option<AllocationId>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: Option<String>,
    pub log: String,
}

/// Durable cluster state used by bootstrap and recovery
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Cluster id, created on first boot
    async fn get_or_create_cluster_id(&self) -> Result<String, StoreError>;

    /// Last liveness timestamp written by any master process
    async fn last_cluster_heartbeat(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Persist a liveness timestamp
    async fn update_cluster_heartbeat(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Experiments that must be restored after a restart
    async fn non_terminal_experiments(&self) -> Result<Vec<ExperimentRecord>, StoreError>;

    /// Open allocations owned by one experiment
    async fn open_allocations(
        &self,
        experiment: ExperimentId,
    ) -> Result<Vec<AllocationRecord>, StoreError>;

    /// Move an experiment into a terminal state
    ///
    /// Its open allocations are closed with the same end time.
    async fn terminate_experiment(
        &self,
        id: ExperimentId,
        state: RunState,
    ) -> Result<(), StoreError>;

    /// Move experiments stuck in DELETING to DELETE_FAILED
    async fn fail_deleting_experiments(&self) -> Result<Vec<ExperimentId>, StoreError>;

    /// Drop container records no open allocation runs in
    ///
    /// Returns how many records were removed.
    async fn cleanup_resources_state(&self) -> Result<usize, StoreError>;

    /// Close every open allocation not in `keep`, stamping `end_time`
    ///
    /// Returns the ids that were closed.
    async fn close_open_allocations(
        &self,
        keep: &[AllocationId],
        end_time: DateTime<Utc>,
    ) -> Result<Vec<AllocationId>, StoreError>;

    /// Close every open task statistic
    async fn end_all_task_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Close every open agent statistic
    async fn end_all_agent_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Close every open instance statistic
    async fn end_all_instance_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Containers agents had reported before the restart
    async fn agent_containers(&self) -> Result<Vec<ContainerRecord>, StoreError>;

    /// Append task log lines
    async fn add_task_logs(&self, logs: Vec<TaskLog>) -> Result<(), StoreError>;
}
