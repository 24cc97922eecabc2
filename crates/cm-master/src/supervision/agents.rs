//! Containers agents reported before the restart

use std::collections::{HashMap, HashSet};

use cm_core::{AgentId, ClusterStore, StoreError};

/// Known (agent, container) pairs
///
/// An allocation can only be reattached when its container is listed here.
#[derive(Debug, Default)]
pub struct AgentDirectory {
    containers: HashMap<AgentId, HashSet<String>>,
}

impl AgentDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every container snapshot from the store
    pub async fn load(store: &dyn ClusterStore) -> Result<Self, StoreError> {
        let mut directory = Self::new();
        for record in store.agent_containers().await? {
            directory.insert(record.agent_id, record.container_id);
        }
        tracing::info!(
            "Loaded {} containers across {} agents",
            directory.container_count(),
            directory.containers.len()
        );
        Ok(directory)
    }

    /// Add a container
    pub fn insert(&mut self, agent: AgentId, container: impl Into<String>) {
        self.containers
            .entry(agent)
            .or_default()
            .insert(container.into());
    }

    /// Whether the agent reported this container
    pub fn has_container(&self, agent: &AgentId, container: &str) -> bool {
        self.containers
            .get(agent)
            .map(|set| set.contains(container))
            .unwrap_or(false)
    }

    /// Total number of containers
    pub fn container_count(&self) -> usize {
        self.containers.values().map(HashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::store::ContainerRecord;
    use cm_core::SnapshotStore;

    #[tokio::test]
    async fn test_load_from_store() {
        let store = SnapshotStore::in_memory();
        store
            .put_container(ContainerRecord {
                agent_id: AgentId::new("agent-1"),
                container_id: "c1".to_string(),
            })
            .await
            .unwrap();

        let directory = AgentDirectory::load(&store).await.unwrap();
        assert!(directory.has_container(&AgentId::new("agent-1"), "c1"));
        assert!(!directory.has_container(&AgentId::new("agent-1"), "c2"));
        assert!(!directory.has_container(&AgentId::new("agent-2"), "c1"));
        assert_eq!(directory.container_count(), 1);
    }
}
