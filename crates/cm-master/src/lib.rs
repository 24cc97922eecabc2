//! cm-master: Cluster master daemon
//!
//! The master serves gRPC and HTTP on one port, demultiplexing connections
//! by their opening bytes. On startup it restores every experiment the
//! previous process left running, closes whatever could not be reattached
//! and only then starts stamping the cluster heartbeat.

pub mod allocation;
pub mod api;
pub mod error;
pub mod heartbeat;
pub mod logs;
pub mod master;
pub mod recovery;
pub mod state;
pub mod supervision;
pub mod transport;

pub use allocation::AllocationRegistry;
pub use error::MasterError;
pub use logs::LogBuffer;
pub use master::{BoundMaster, Master};
pub use state::MasterState;
