//! Cluster liveness heartbeat
//!
//! Periodically stamps "cluster is alive" into the store. The next master to
//! start uses the last stamp as the end time of anything this one left open.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cm_core::time::now_millis;
use cm_core::ClusterStore;

/// Write a heartbeat immediately and then once per `interval` until cancelled
///
/// Write failures are logged and retried on the next tick.
pub async fn run_cluster_heartbeat(
    store: Arc<dyn ClusterStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    // the first tick of a tokio interval completes immediately
    let mut ticker = tokio::time::interval(interval);

    tracing::info!("Starting cluster heartbeat (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.update_cluster_heartbeat(now_millis()).await {
                    tracing::error!("Failed to update cluster heartbeat: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Cluster heartbeat shutting down");
                break;
            }
        }
    }
}

/// Spawn [`run_cluster_heartbeat`] on the runtime
pub fn spawn_cluster_heartbeat(
    store: Arc<dyn ClusterStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_cluster_heartbeat(store, interval, cancel))
}
