//! cm-core: Core abstractions and configuration for the cluster master
//!
//! This crate provides the configuration layer, the persistent model of
//! experiments and allocations, and the [`store::ClusterStore`] seam through
//! which the master reads and repairs state after a restart.

pub mod config;
pub mod error;
pub mod store;
pub mod time;
pub mod types;

pub use error::{ConfigError, StoreError};
pub use store::{ClusterStore, SnapshotStore};
pub use types::{AgentId, AllocationId, ExperimentId, RunState, TaskId};
