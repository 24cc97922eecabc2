//! Restart recovery
//!
//! Runs once per process, in this order:
//!
//! 1. restore every non-terminal experiment under a concurrency cap and
//!    wait for all of them
//! 2. fail experiments that were being deleted
//! 3. drop container records no open allocation runs in
//! 4. close allocations and statistics nobody reattached, stamped with the
//!    previous process's last heartbeat
//! 5. start the cluster heartbeat
//!
//! The heartbeat must not start before step 4: its stamps would otherwise
//! become the end time of allocations that died with the previous process.

mod orchestrator;
mod reconcile;

pub use orchestrator::{RecoveryOrchestrator, RecoveryReport, RestoreState};
pub use reconcile::{ReconcileReport, Reconciler};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cm_core::time::last_known_alive;
use cm_core::{ClusterStore, ExperimentId, StoreError};

use crate::allocation::AllocationRegistry;
use crate::heartbeat::spawn_cluster_heartbeat;
use crate::supervision::Supervisor;

/// Inputs to [`recover`]
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub max_concurrent_restores: usize,
    pub heartbeat_interval: Duration,
    /// Last heartbeat written before this process started
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Result of a completed recovery
pub struct RecoveryOutcome {
    pub restores: RecoveryReport,
    pub deleting_failed: Vec<ExperimentId>,
    /// Container records dropped before reconciliation
    pub resources_cleaned: usize,
    pub reconciled: ReconcileReport,
    /// Heartbeat task, stopped by cancelling the token passed to [`recover`]
    pub heartbeat: JoinHandle<()>,
}

/// Run the whole recovery sequence
pub async fn recover(
    store: Arc<dyn ClusterStore>,
    supervisor: Arc<dyn Supervisor>,
    allocations: Arc<AllocationRegistry>,
    plan: RecoveryPlan,
    cancel: CancellationToken,
) -> Result<RecoveryOutcome, StoreError> {
    let orchestrator = RecoveryOrchestrator::with_max_concurrent(
        Arc::clone(&store),
        supervisor,
        plan.max_concurrent_restores,
    );
    let restores = orchestrator.restore_non_terminal().await?;

    let deleting_failed = store.fail_deleting_experiments().await?;
    if !deleting_failed.is_empty() {
        tracing::warn!(
            "Marked {} experiments stuck in deletion as DELETE_FAILED",
            deleting_failed.len()
        );
    }

    let resources_cleaned = store.cleanup_resources_state().await?;
    if resources_cleaned > 0 {
        tracing::info!("Dropped {} stale container records", resources_cleaned);
    }

    let end_time = last_known_alive(plan.last_heartbeat);
    let reconciled = Reconciler::new(Arc::clone(&store), allocations)
        .reconcile(end_time)
        .await?;

    let heartbeat = spawn_cluster_heartbeat(store, plan.heartbeat_interval, cancel);

    Ok(RecoveryOutcome {
        restores,
        deleting_failed,
        resources_cleaned,
        reconciled,
        heartbeat,
    })
}
