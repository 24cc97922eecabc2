//! Registry of supervised experiment tasks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use cm_core::store::ExperimentRecord;
use cm_core::{ClusterStore, ExperimentId};

use super::agents::AgentDirectory;
use super::experiment::{ExperimentActor, ExperimentConfig, ExperimentMessage, ExperimentStatus};
use super::Supervisor;
use crate::allocation::AllocationRegistry;
use crate::error::{RestoreError, SupervisionError};

/// Messages queued per experiment before senders wait
const MAILBOX_CAPACITY: usize = 64;

struct Handle {
    generation: u64,
    tx: mpsc::Sender<ExperimentMessage>,
    cancel: CancellationToken,
}

/// Experiment tasks keyed by experiment id
pub struct ExperimentRegistry {
    experiments: Arc<DashMap<ExperimentId, Handle>>,
    generation: AtomicU64,
    store: Arc<dyn ClusterStore>,
    allocations: Arc<AllocationRegistry>,
    agents: Arc<AgentDirectory>,
    ready_timeout: Duration,
    cancel: CancellationToken,
}

impl ExperimentRegistry {
    /// Create a registry
    ///
    /// `ready_timeout` bounds how long a restore waits for the experiment
    /// task to report that its allocations were reattached.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        allocations: Arc<AllocationRegistry>,
        agents: AgentDirectory,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            experiments: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            store,
            allocations,
            agents: Arc::new(agents),
            ready_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Ids of all supervised experiments
    pub fn list(&self) -> Vec<ExperimentId> {
        let mut ids: Vec<_> = self.experiments.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    /// Number of supervised experiments
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// Check if no experiments are supervised
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Ask one experiment for its status
    pub async fn status(&self, id: ExperimentId) -> Result<ExperimentStatus, SupervisionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, ExperimentMessage::Ping(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| SupervisionError::MailboxClosed(id))
    }

    /// Status of every experiment that answers
    pub async fn statuses(&self) -> Vec<ExperimentStatus> {
        let mut statuses = Vec::new();
        for id in self.list() {
            match self.status(id).await {
                Ok(status) => statuses.push(status),
                Err(e) => tracing::debug!("Skipping experiment {}: {}", id, e),
            }
        }
        statuses
    }

    /// Stop every experiment task
    pub fn shutdown(&self) {
        if !self.experiments.is_empty() {
            tracing::info!("Stopping {} experiment tasks", self.experiments.len());
        }
        self.cancel.cancel();
    }

    fn sender(&self, id: ExperimentId) -> Result<mpsc::Sender<ExperimentMessage>, SupervisionError> {
        self.experiments
            .get(&id)
            .map(|handle| handle.tx.clone())
            .ok_or(SupervisionError::NotFound(id))
    }
}

#[async_trait]
impl Supervisor for ExperimentRegistry {
    async fn restore(&self, record: ExperimentRecord) -> Result<(), RestoreError> {
        let id = record.id;
        let config = ExperimentConfig::from_record(&record)?;

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let cancel = self.cancel.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        match self.experiments.entry(id) {
            Entry::Occupied(_) => return Err(RestoreError::AlreadyRunning(id)),
            Entry::Vacant(slot) => {
                slot.insert(Handle {
                    generation,
                    tx,
                    cancel: cancel.clone(),
                });
            }
        }

        let mut actor = ExperimentActor::new(
            record,
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.allocations),
            rx,
            cancel.clone(),
        );
        let agents = Arc::clone(&self.agents);
        let experiments = Arc::clone(&self.experiments);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            match actor.reattach(&agents).await {
                Ok(()) => {
                    let _ = ready_tx.send(Ok(()));
                    actor.run().await;
                }
                Err(e) => {
                    actor.release();
                    let _ = ready_tx.send(Err(e));
                }
            }
            experiments.remove_if(&id, |_, handle| handle.generation == generation);
        });

        match tokio::time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(experiment_id = %id, "Experiment restored");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(RestoreError::Exited(id)),
            Err(_) => {
                cancel.cancel();
                Err(RestoreError::NotReady {
                    id,
                    timeout: self.ready_timeout,
                })
            }
        }
    }

    async fn send(
        &self,
        id: ExperimentId,
        message: ExperimentMessage,
    ) -> Result<(), SupervisionError> {
        let tx = self.sender(id)?;
        tx.send(message)
            .await
            .map_err(|_| SupervisionError::MailboxClosed(id))
    }

    fn stop(&self, id: ExperimentId) -> Result<(), SupervisionError> {
        let handle = self
            .experiments
            .get(&id)
            .ok_or(SupervisionError::NotFound(id))?;
        handle.cancel.cancel();
        Ok(())
    }

    fn is_tracked(&self, id: ExperimentId) -> bool {
        self.experiments.contains_key(&id)
    }
}

impl Drop for ExperimentRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
