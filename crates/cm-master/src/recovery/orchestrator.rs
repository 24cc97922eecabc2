//! Bounded-concurrency restore of non-terminal experiments

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cm_core::config::DEFAULT_MAX_CONCURRENT_RESTORES;
use cm_core::{ClusterStore, ExperimentId, RunState, StoreError};

use crate::supervision::Supervisor;

/// Progress of one experiment through recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    /// Discovered, waiting for a permit
    Pending,
    /// Holding a permit, restore in flight
    Restoring,
    /// Supervised again
    Restored,
    /// Persisted as errored
    Failed,
}

impl RestoreState {
    /// Whether recovery is done with this experiment
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Restored | Self::Failed)
    }
}

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: Vec<ExperimentId>,
    pub failed: Vec<ExperimentId>,
    /// Already supervised or already handled by an earlier pass
    pub skipped: Vec<ExperimentId>,
}

impl RecoveryReport {
    /// Number of experiments that reached a final state in this pass
    pub fn finished(&self) -> usize {
        self.restored.len() + self.failed.len()
    }
}

/// Restores every non-terminal experiment with at most `max_concurrent` in flight
pub struct RecoveryOrchestrator {
    store: Arc<dyn ClusterStore>,
    supervisor: Arc<dyn Supervisor>,
    max_concurrent: usize,
    ledger: Arc<DashMap<ExperimentId, RestoreState>>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator with the default concurrency cap
    pub fn new(store: Arc<dyn ClusterStore>, supervisor: Arc<dyn Supervisor>) -> Self {
        Self::with_max_concurrent(store, supervisor, DEFAULT_MAX_CONCURRENT_RESTORES)
    }

    /// Create an orchestrator with an explicit concurrency cap
    pub fn with_max_concurrent(
        store: Arc<dyn ClusterStore>,
        supervisor: Arc<dyn Supervisor>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            supervisor,
            max_concurrent: max_concurrent.max(1),
            ledger: Arc::new(DashMap::new()),
        }
    }

    /// Concurrency cap
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Where an experiment is in recovery
    pub fn state(&self, id: ExperimentId) -> Option<RestoreState> {
        self.ledger.get(&id).map(|state| *state)
    }

    /// Restore every non-terminal experiment and wait for all of them
    ///
    /// Fails only if the experiment list cannot be read. A failed restore is
    /// logged and its experiment persisted as errored; siblings carry on.
    pub async fn restore_non_terminal(&self) -> Result<RecoveryReport, StoreError> {
        let records = self.store.non_terminal_experiments().await?;
        let mut report = RecoveryReport::default();

        tracing::info!(
            "Restoring {} non-terminal experiments ({} at a time)",
            records.len(),
            self.max_concurrent
        );

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for record in records {
            let id = record.id;
            let handled = self.state(id).map(RestoreState::is_finished).unwrap_or(false);
            if handled || self.supervisor.is_tracked(id) {
                tracing::debug!(experiment_id = %id, "Experiment already handled, skipping");
                report.skipped.push(id);
                continue;
            }

            self.ledger.insert(id, RestoreState::Pending);
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!("Restore permits unavailable: {}", e);
                    break;
                }
            };
            self.ledger.insert(id, RestoreState::Restoring);

            let store = Arc::clone(&self.store);
            let supervisor = Arc::clone(&self.supervisor);
            let ledger = Arc::clone(&self.ledger);
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = match AssertUnwindSafe(supervisor.restore(record))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => RestoreState::Restored,
                    Ok(Err(e)) => {
                        tracing::warn!(experiment_id = %id, "Failed to restore experiment: {}", e);
                        mark_failed(store.as_ref(), id).await;
                        RestoreState::Failed
                    }
                    Err(_) => {
                        tracing::error!(experiment_id = %id, "Experiment restore panicked");
                        mark_failed(store.as_ref(), id).await;
                        RestoreState::Failed
                    }
                };
                ledger.insert(id, outcome);
                (id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, RestoreState::Restored)) => report.restored.push(id),
                Ok((id, _)) => report.failed.push(id),
                Err(e) => tracing::error!("Restore task did not complete: {}", e),
            }
        }

        report.restored.sort();
        report.failed.sort();
        tracing::info!(
            "Recovery finished: {} restored, {} failed, {} skipped",
            report.restored.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

async fn mark_failed(store: &dyn ClusterStore, id: ExperimentId) {
    if let Err(e) = store.terminate_experiment(id, RunState::Error).await {
        tracing::error!(
            experiment_id = %id,
            "Failed to mark experiment as errored: {}",
            e
        );
    }
}
