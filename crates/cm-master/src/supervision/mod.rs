//! Experiment supervision
//!
//! Every restored experiment runs as its own task with a mailbox. The
//! [`Supervisor`] trait is the seam recovery talks to; [`ExperimentRegistry`]
//! is the implementation that keeps the tasks keyed by experiment id.

mod agents;
mod experiment;
mod registry;

pub use agents::AgentDirectory;
pub use experiment::{ExperimentConfig, ExperimentMessage, ExperimentStatus, ResourcesConfig};
pub use registry::ExperimentRegistry;

use async_trait::async_trait;

use cm_core::store::ExperimentRecord;
use cm_core::ExperimentId;

use crate::error::{RestoreError, SupervisionError};

/// Supervision hierarchy for experiments
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Rebuild supervision state for a persisted experiment
    ///
    /// Returns once the experiment reports that its allocations were
    /// reattached or marked unrecoverable.
    async fn restore(&self, record: ExperimentRecord) -> Result<(), RestoreError>;

    /// Deliver a message to a supervised experiment
    async fn send(&self, id: ExperimentId, message: ExperimentMessage)
        -> Result<(), SupervisionError>;

    /// Stop supervising an experiment without changing its persisted state
    fn stop(&self, id: ExperimentId) -> Result<(), SupervisionError>;

    /// Whether the experiment is supervised by this process
    fn is_tracked(&self, id: ExperimentId) -> bool;
}
