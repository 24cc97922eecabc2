//! Shared fixtures for cm-master integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use cm_core::store::{AllocationRecord, ContainerRecord, ExperimentRecord, TaskLog};
use cm_core::{
    AgentId, AllocationId, ClusterStore, ExperimentId, RunState, SnapshotStore, StoreError,
};
use cm_master::supervision::{AgentDirectory, ExperimentRegistry};
use cm_master::AllocationRegistry;

/// Store that logs the name of every call before delegating
pub struct RecordingStore {
    pub inner: SnapshotStore,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingStore {
    pub fn new(inner: SnapshotStore) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// Position of the first call with this name
    pub fn first(&self, name: &str) -> Option<usize> {
        self.calls.lock().iter().position(|call| *call == name)
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().push(name);
    }
}

#[async_trait]
impl ClusterStore for RecordingStore {
    async fn get_or_create_cluster_id(&self) -> Result<String, StoreError> {
        self.record("get_or_create_cluster_id");
        self.inner.get_or_create_cluster_id().await
    }

    async fn last_cluster_heartbeat(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.record("last_cluster_heartbeat");
        self.inner.last_cluster_heartbeat().await
    }

    async fn update_cluster_heartbeat(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.record("update_cluster_heartbeat");
        self.inner.update_cluster_heartbeat(at).await
    }

    async fn non_terminal_experiments(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        self.record("non_terminal_experiments");
        self.inner.non_terminal_experiments().await
    }

    async fn open_allocations(
        &self,
        experiment: ExperimentId,
    ) -> Result<Vec<AllocationRecord>, StoreError> {
        self.record("open_allocations");
        self.inner.open_allocations(experiment).await
    }

    async fn terminate_experiment(
        &self,
        id: ExperimentId,
        state: RunState,
    ) -> Result<(), StoreError> {
        self.record("terminate_experiment");
        self.inner.terminate_experiment(id, state).await
    }

    async fn fail_deleting_experiments(&self) -> Result<Vec<ExperimentId>, StoreError> {
        self.record("fail_deleting_experiments");
        self.inner.fail_deleting_experiments().await
    }

    async fn cleanup_resources_state(&self) -> Result<usize, StoreError> {
        self.record("cleanup_resources_state");
        self.inner.cleanup_resources_state().await
    }

    async fn close_open_allocations(
        &self,
        keep: &[AllocationId],
        end_time: DateTime<Utc>,
    ) -> Result<Vec<AllocationId>, StoreError> {
        self.record("close_open_allocations");
        self.inner.close_open_allocations(keep, end_time).await
    }

    async fn end_all_task_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError> {
        self.record("end_all_task_stats");
        self.inner.end_all_task_stats(end_time).await
    }

    async fn end_all_agent_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError> {
        self.record("end_all_agent_stats");
        self.inner.end_all_agent_stats(end_time).await
    }

    async fn end_all_instance_stats(&self, end_time: DateTime<Utc>) -> Result<usize, StoreError> {
        self.record("end_all_instance_stats");
        self.inner.end_all_instance_stats(end_time).await
    }

    async fn agent_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        self.record("agent_containers");
        self.inner.agent_containers().await
    }

    async fn add_task_logs(&self, logs: Vec<TaskLog>) -> Result<(), StoreError> {
        self.record("add_task_logs");
        self.inner.add_task_logs(logs).await
    }
}

/// Seed an allocation running in `container` on `agent-1`
pub fn placed(id: &str, experiment: i64, container: &str) -> AllocationRecord {
    AllocationRecord::open(
        id,
        ExperimentId(experiment),
        Some((AgentId::new("agent-1"), container.to_string())),
    )
}

/// Register a container as reported by `agent-1`
pub async fn known_container(store: &SnapshotStore, container: &str) {
    store
        .put_container(ContainerRecord {
            agent_id: AgentId::new("agent-1"),
            container_id: container.to_string(),
        })
        .await
        .unwrap();
}

/// Registry backed by `store` with the containers the store knows about
pub async fn registry(
    store: Arc<dyn ClusterStore>,
    allocations: Arc<AllocationRegistry>,
) -> Arc<ExperimentRegistry> {
    let agents = AgentDirectory::load(store.as_ref()).await.unwrap();
    Arc::new(ExperimentRegistry::new(
        store,
        allocations,
        agents,
        Duration::from_secs(5),
    ))
}

/// Poll `check` until it holds or a few seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
