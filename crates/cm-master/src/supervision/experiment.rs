//! Per-experiment supervision task

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use cm_core::store::ExperimentRecord;
use cm_core::{AllocationId, ClusterStore, ExperimentId, RunState, StoreError};

use super::agents::AgentDirectory;
use crate::allocation::AllocationRegistry;
use crate::error::RestoreError;

fn default_slots_per_trial() -> u32 {
    1
}

/// Resource request of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_slots_per_trial")]
    pub slots_per_trial: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            slots_per_trial: default_slots_per_trial(),
        }
    }
}

/// The parts of a user's experiment configuration the master acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub max_restarts: u32,
}

impl ExperimentConfig {
    /// Parse the configuration stored with an experiment
    pub fn from_record(record: &ExperimentRecord) -> Result<Self, RestoreError> {
        let config: Self =
            serde_json::from_value(record.config.clone()).map_err(|e| {
                RestoreError::InvalidConfig {
                    id: record.id,
                    reason: e.to_string(),
                }
            })?;

        if config.resources.slots_per_trial == 0 {
            return Err(RestoreError::InvalidConfig {
                id: record.id,
                reason: "resources.slots_per_trial must be greater than 0".to_string(),
            });
        }

        Ok(config)
    }
}

/// Messages an experiment task accepts
#[derive(Debug)]
pub enum ExperimentMessage {
    /// Report current status
    Ping(oneshot::Sender<ExperimentStatus>),
    /// An allocation finished and no longer holds resources
    AllocationExited(AllocationId),
    /// Cancel the experiment and release everything it holds
    Kill,
}

/// Point-in-time view of a supervised experiment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentStatus {
    pub id: ExperimentId,
    pub name: String,
    pub state: RunState,
    /// Allocations reattached and held by this process
    pub allocations: Vec<AllocationId>,
    /// Allocations whose container no longer exists
    pub unrecoverable: Vec<AllocationId>,
}

pub(crate) struct ExperimentActor {
    id: ExperimentId,
    state: RunState,
    config: ExperimentConfig,
    store: Arc<dyn ClusterStore>,
    allocations: Arc<AllocationRegistry>,
    mailbox: mpsc::Receiver<ExperimentMessage>,
    cancel: CancellationToken,
    attached: Vec<AllocationId>,
    unrecoverable: Vec<AllocationId>,
}

impl ExperimentActor {
    pub(crate) fn new(
        record: ExperimentRecord,
        config: ExperimentConfig,
        store: Arc<dyn ClusterStore>,
        allocations: Arc<AllocationRegistry>,
        mailbox: mpsc::Receiver<ExperimentMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: record.id,
            state: record.state,
            config,
            store,
            allocations,
            mailbox,
            cancel,
            attached: Vec::new(),
            unrecoverable: Vec::new(),
        }
    }

    /// Take back every open allocation whose container is still known
    ///
    /// Allocations that cannot be reattached stay open in the store; the
    /// reconciler closes them once recovery is over.
    pub(crate) async fn reattach(&mut self, agents: &AgentDirectory) -> Result<(), StoreError> {
        for allocation in self.store.open_allocations(self.id).await? {
            let placed = match (&allocation.agent_id, &allocation.container_id) {
                (Some(agent), Some(container)) => agents.has_container(agent, container),
                _ => false,
            };

            if placed {
                self.allocations.register(allocation.id.clone());
                self.attached.push(allocation.id);
            } else {
                tracing::warn!(
                    experiment_id = %self.id,
                    allocation_id = %allocation.id,
                    "Allocation container is gone, marking it unrecoverable"
                );
                self.unrecoverable.push(allocation.id);
            }
        }

        tracing::debug!(
            experiment_id = %self.id,
            "Reattached {} allocations ({} unrecoverable)",
            self.attached.len(),
            self.unrecoverable.len()
        );
        Ok(())
    }

    /// Serve the mailbox until killed, cancelled or orphaned
    pub(crate) async fn run(mut self) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.mailbox.recv() => message,
            };

            match message {
                Some(ExperimentMessage::Ping(reply)) => {
                    let _ = reply.send(self.status());
                }
                Some(ExperimentMessage::AllocationExited(id)) => {
                    if let Some(pos) = self.attached.iter().position(|a| a == &id) {
                        self.attached.swap_remove(pos);
                        self.allocations.deregister(&id);
                    }
                }
                Some(ExperimentMessage::Kill) => {
                    self.kill().await;
                    break;
                }
                None => break,
            }
        }

        self.release();
        tracing::debug!(experiment_id = %self.id, "Experiment task exited");
    }

    async fn kill(&mut self) {
        tracing::info!(experiment_id = %self.id, "Killing experiment");
        self.state = RunState::StoppingCanceled;
        match self
            .store
            .terminate_experiment(self.id, RunState::Canceled)
            .await
        {
            Ok(()) => self.state = RunState::Canceled,
            Err(e) => tracing::error!(
                experiment_id = %self.id,
                "Failed to persist cancellation: {}",
                e
            ),
        }
    }

    /// Drop every allocation this task holds from the live registry
    pub(crate) fn release(&mut self) {
        for id in self.attached.drain(..) {
            self.allocations.deregister(&id);
        }
    }

    fn status(&self) -> ExperimentStatus {
        ExperimentStatus {
            id: self.id,
            name: self.config.name.clone(),
            state: self.state,
            allocations: self.attached.clone(),
            unrecoverable: self.unrecoverable.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let record = ExperimentRecord::active(ExperimentId(1), json!({"name": "mnist"}));
        let config = ExperimentConfig::from_record(&record).unwrap();
        assert_eq!(config.name, "mnist");
        assert_eq!(config.resources.slots_per_trial, 1);
        assert_eq!(config.max_restarts, 0);
    }

    #[test]
    fn test_config_type_mismatch() {
        let record = ExperimentRecord::active(
            ExperimentId(7),
            json!({"resources": {"slots_per_trial": "many"}}),
        );
        assert!(matches!(
            ExperimentConfig::from_record(&record),
            Err(RestoreError::InvalidConfig { id: ExperimentId(7), .. })
        ));
    }

    #[test]
    fn test_config_zero_slots() {
        let record = ExperimentRecord::active(
            ExperimentId(3),
            json!({"resources": {"slots_per_trial": 0}}),
        );
        assert!(ExperimentConfig::from_record(&record).is_err());
    }

    #[test]
    fn test_config_not_an_object() {
        let record = ExperimentRecord::active(ExperimentId(4), json!("oops"));
        assert!(ExperimentConfig::from_record(&record).is_err());
    }
}
