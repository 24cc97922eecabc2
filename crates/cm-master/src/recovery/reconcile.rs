//! Closing records a dead master left open

use std::sync::Arc;

use chrono::{DateTime, Utc};

use cm_core::{AllocationId, ClusterStore, StoreError};

use crate::allocation::AllocationRegistry;

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Allocations left open because this process holds them
    pub kept: Vec<AllocationId>,
    /// Allocations closed
    pub closed: Vec<AllocationId>,
    pub agent_stats_ended: usize,
    pub instance_stats_ended: usize,
    pub task_stats_ended: usize,
}

/// Closes persisted allocations and statistics nobody owns anymore
pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    allocations: Arc<AllocationRegistry>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ClusterStore>, allocations: Arc<AllocationRegistry>) -> Self {
        Self { store, allocations }
    }

    /// Close everything not reattached by recovery, stamping `end_time`
    ///
    /// The live allocation set is snapshotted once before the store is
    /// touched.
    pub async fn reconcile(&self, end_time: DateTime<Utc>) -> Result<ReconcileReport, StoreError> {
        let kept = self.allocations.list();
        let closed = self.store.close_open_allocations(&kept, end_time).await?;
        if !closed.is_empty() {
            tracing::info!(
                "Closed {} dangling allocations (end time {})",
                closed.len(),
                end_time
            );
        }

        let agent_stats_ended = self.store.end_all_agent_stats(end_time).await?;
        let instance_stats_ended = self.store.end_all_instance_stats(end_time).await?;
        let task_stats_ended = self.store.end_all_task_stats(end_time).await?;
        tracing::debug!(
            "Ended {} agent, {} instance and {} task statistics",
            agent_stats_ended,
            instance_stats_ended,
            task_stats_ended
        );

        Ok(ReconcileReport {
            kept,
            closed,
            agent_stats_ended,
            instance_stats_ended,
            task_stats_ended,
        })
    }
}
