//! Snapshot-backed [`ClusterStore`]
//!
//! All state lives in one [`ClusterSnapshot`] guarded by a mutex. When opened
//! with a path, every mutation is written to a JSON file before it becomes
//! visible, so a restarted process sees exactly what the previous one
//! committed. Task logs are not part of the snapshot: they are appended to
//! a JSON-lines file beside it and only the most recent lines stay in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{
    AllocationRecord, ClusterStore, ContainerRecord, ExperimentRecord, StatsKind, StatsRecord,
    TaskLog,
};
use crate::error::StoreError;
use crate::types::{AgentId, AllocationId, ExperimentId, RunState};

/// Task log lines kept in memory
pub const TASK_LOG_RETENTION: usize = 10_000;

/// Complete persisted cluster state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    pub cluster_id: Option<String>,
    pub cluster_heartbeat: Option<DateTime<Utc>>,
    pub experiments: Vec<ExperimentRecord>,
    pub allocations: Vec<AllocationRecord>,
    pub stats: Vec<StatsRecord>,
    pub containers: Vec<ContainerRecord>,
}

impl ClusterSnapshot {
    fn experiment_mut(&mut self, id: ExperimentId) -> Result<&mut ExperimentRecord, StoreError> {
        self.experiments
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::ExperimentNotFound(id))
    }

    fn end_stats(&mut self, kind: StatsKind, end_time: DateTime<Utc>) -> usize {
        let mut ended = 0;
        for record in self.stats.iter_mut().filter(|s| s.kind == kind) {
            if record.end_time.is_none() {
                record.end_time = Some(end_time);
                ended += 1;
            }
        }
        ended
    }
}

/// Cluster store holding a snapshot in memory, optionally mirrored to disk
pub struct SnapshotStore {
    snapshot: Mutex<ClusterSnapshot>,
    /// Held across a file write so writers commit in order
    writer: tokio::sync::Mutex<()>,
    task_logs: Mutex<VecDeque<TaskLog>>,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Create a store that keeps state in memory only
    pub fn in_memory() -> Self {
        Self::with_snapshot(ClusterSnapshot::default(), None)
    }

    /// Open a file-backed store, loading existing state if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&content)?
        } else {
            ClusterSnapshot::default()
        };

        tracing::debug!("Opened cluster store at {}", path.display());

        Ok(Self::with_snapshot(snapshot, Some(path)))
    }

    fn with_snapshot(snapshot: ClusterSnapshot, path: Option<PathBuf>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            writer: tokio::sync::Mutex::new(()),
            task_logs: Mutex::new(VecDeque::new()),
            path,
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// File task logs are appended to, if the store is file-backed
    pub fn task_log_path(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|path| path.with_extension("task_logs.jsonl"))
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot.lock().clone()
    }

    /// Most recent task log lines, oldest first
    pub fn task_logs(&self) -> Vec<TaskLog> {
        self.task_logs.lock().iter().cloned().collect()
    }

    /// Look up one experiment
    pub fn experiment(&self, id: ExperimentId) -> Option<ExperimentRecord> {
        self.snapshot
            .lock()
            .experiments
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Look up one allocation
    pub fn allocation(&self, id: &AllocationId) -> Option<AllocationRecord> {
        self.snapshot
            .lock()
            .allocations
            .iter()
            .find(|a| &a.id == id)
            .cloned()
    }

    /// Insert or replace an experiment
    pub async fn put_experiment(&self, record: ExperimentRecord) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.experiments.retain(|e| e.id != record.id);
            s.experiments.push(record);
            Ok(())
        })
        .await
    }

    /// Insert or replace an allocation
    pub async fn put_allocation(&self, record: AllocationRecord) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.allocations.retain(|a| a.id != record.id);
            s.allocations.push(record);
            Ok(())
        })
        .await
    }

    /// Record a container reported by an agent
    pub async fn put_container(&self, record: ContainerRecord) -> Result<(), StoreError> {
        self.mutate(|s| {
            if !s.containers.contains(&record) {
                s.containers.push(record);
            }
            Ok(())
        })
        .await
    }

    /// Open a usage statistic
    pub async fn put_stats(&self, record: StatsRecord) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.stats.push(record);
            Ok(())
        })
        .await
    }

    /// Apply a mutation and persist it before publishing
    ///
    /// The mutation runs on a copy; a failed write leaves the visible state unchanged.
    async fn mutate<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut ClusterSnapshot) -> Result<R, StoreError> + Send,
        R: Send,
    {
        let _writer = self.writer.lock().await;
        let mut next = self.snapshot.lock().clone();
        let result = f(&mut next)?;

        if let Some(path) = &self.path {
            write_snapshot(path, &next).await?;
        }

        *self.snapshot.lock() = next;
        Ok(result)
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

async fn write_snapshot(path: &Path, snapshot: &ClusterSnapshot) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let content = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

async fn append_task_logs(path: &Path, logs: &[TaskLog]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut content = Vec::new();
    for log in logs {
        serde_json::to_writer(&mut content, log)?;
        content.push(b'\n');
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;
    file.write_all(&content).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl ClusterStore for SnapshotStore {
    async fn get_or_create_cluster_id(&self) -> Result<String, StoreError> {
        if let Some(id) = self.snapshot.lock().cluster_id.clone() {
            return Ok(id);
        }
        self.mutate(|s| {
            let id = s
                .cluster_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
            Ok(id.clone())
        })
        .await
    }

    async fn last_cluster_heartbeat(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.snapshot.lock().cluster_heartbeat)
    }

    async fn update_cluster_heartbeat(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.cluster_heartbeat = Some(at);
            Ok(())
        })
        .await
    }

    async fn non_terminal_experiments(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        let mut experiments: Vec<_> = self
            .snapshot
            .lock()
            .experiments
            .iter()
            .filter(|e| e.state.needs_restore())
            .cloned()
            .collect();
        experiments.sort_by_key(|e| e.id);
        Ok(experiments)
    }

    async fn open_allocations(
        &self,
        experiment: ExperimentId,
    ) -> Result<Vec<AllocationRecord>, StoreError> {
        Ok(self
            .snapshot
            .lock()
            .allocations
            .iter()
            .filter(|a| a.experiment_id == experiment && a.is_open())
            .cloned()
            .collect())
    }

    async fn terminate_experiment(
        &self,
        id: ExperimentId,
        state: RunState,
    ) -> Result<(), StoreError> {
        if !state.is_terminal() {
            return Err(StoreError::Unavailable(format!(
                "refusing to terminate experiment {} into non-terminal state {}",
                id, state
            )));
        }
        let end_time = crate::time::now_millis();
        self.mutate(|s| {
            let experiment = s.experiment_mut(id)?;
            experiment.state = state;
            experiment.end_time = Some(end_time);
            for allocation in s.allocations.iter_mut() {
                if allocation.experiment_id == id && allocation.is_open() {
                    allocation.end_time = Some(end_time);
                }
            }
            Ok(())
        })
        .await
    }

    async fn fail_deleting_experiments(&self) -> Result<Vec<ExperimentId>, StoreError> {
        self.mutate(|s| {
            let mut failed = Vec::new();
            for experiment in s.experiments.iter_mut() {
                if experiment.state == RunState::Deleting {
                    experiment.state = RunState::DeleteFailed;
                    failed.push(experiment.id);
                }
            }
            Ok(failed)
        })
        .await
    }

    async fn cleanup_resources_state(&self) -> Result<usize, StoreError> {
        self.mutate(|s| {
            let in_use: HashSet<(&AgentId, &str)> = s
                .allocations
                .iter()
                .filter(|a| a.is_open())
                .filter_map(|a| Some((a.agent_id.as_ref()?, a.container_id.as_deref()?)))
                .collect();
            let before = s.containers.len();
            let kept: Vec<ContainerRecord> = s
                .containers
                .iter()
                .filter(|c| in_use.contains(&(&c.agent_id, c.container_id.as_str())))
                .cloned()
                .collect();
            s.containers = kept;
            Ok(before - s.containers.len())
        })
        .await
    }

    async fn close_open_allocations(
        &self,
        keep: &[AllocationId],
        end_time: DateTime<Utc>,
    ) -> Result<Vec<AllocationId>, StoreError> {
        let keep: HashSet<&AllocationId> = keep.iter().collect();
        self.mutate(|s| {
            let mut closed = Vec::new();
            for allocation in s.allocations.iter_mut() {
                if allocation.is_open() && !keep.contains(&allocation.id) {
                    allocation.end_time = Some(end_time);
                    closed.push(allocation.id.clone());
                }
            }
            Ok(closed)
        })
        .await
    }

    async fn end_all_task_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError> {
        self.mutate(|s| Ok(s.end_stats(StatsKind::Task, end_time)))
            .await
    }

    async fn end_all_agent_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError> {
        self.mutate(|s| Ok(s.end_stats(StatsKind::Agent, end_time)))
            .await
    }

    async fn end_all_instance_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError> {
        self.mutate(|s| Ok(s.end_stats(StatsKind::Instance, end_time)))
            .await
    }

    async fn agent_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self.snapshot.lock().containers.clone())
    }

    async fn add_task_logs(&self, logs: Vec<TaskLog>) -> Result<(), StoreError> {
        if logs.is_empty() {
            return Ok(());
        }

        if let Some(path) = self.task_log_path() {
            let _writer = self.writer.lock().await;
            append_task_logs(&path, &logs).await?;
        }

        let mut retained = self.task_logs.lock();
        retained.extend(logs);
        let excess = retained.len().saturating_sub(TASK_LOG_RETENTION);
        retained.drain(..excess);
        Ok(())
    }
}
