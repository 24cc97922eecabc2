//! Master error types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use cm_core::{ConfigError, ExperimentId, StoreError};

/// Boxed error returned by a serving loop
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error for a master run
#[derive(Error, Debug)]
pub enum MasterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener could not be resolved
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A serving loop failed or the run was cancelled
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistence error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Listener resolution errors
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Malformed socket activation environment
    #[error("Invalid systemd activation environment: {0}")]
    Activation(String),

    /// More than one descriptor was passed
    #[error("Expected at most 1 systemd listener, got {0}")]
    TooManyInherited(usize),

    /// Configured port could not be bound
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Inherited descriptor is not a TCP listener
    #[error("Inherited descriptor {0} is not a TCP listener")]
    NotTcp(i32),

    /// Socket inode was not present in any TCP table
    #[error("Socket inode {0} not found in the kernel TCP tables")]
    InodeNotFound(String),

    /// A TCP table line could not be parsed
    #[error("Malformed TCP table entry: {0}")]
    MalformedTable(String),

    /// Port discovery needs procfs
    #[error("Port discovery is not supported on this platform")]
    Unsupported,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TLS configuration errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// PEM file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Certificate file holds no certificates
    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    /// Key file holds no private key
    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Client verifier could not be built from the CA bundle
    #[error("Invalid client CA bundle: {0}")]
    ClientVerifier(String),

    /// rustls rejected the configuration
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Errors from the transport supervisor
#[derive(Error, Debug)]
pub enum TransportError {
    /// A serving loop exited with an error
    #[error("{name} failed: {source}")]
    LoopFailed {
        name: &'static str,
        #[source]
        source: BoxError,
    },

    /// Governing token was cancelled before any loop exited
    #[error("Transport cancelled")]
    Cancelled,

    /// No loops were registered
    #[error("No serving loops registered")]
    NoLoops,
}

/// Reasons an experiment could not be brought back under supervision
#[derive(Error, Debug)]
pub enum RestoreError {
    /// Experiment is already supervised by this process
    #[error("Experiment {0} is already running")]
    AlreadyRunning(ExperimentId),

    /// Persisted configuration no longer parses
    #[error("Experiment {id} has an invalid configuration: {reason}")]
    InvalidConfig { id: ExperimentId, reason: String },

    /// Experiment task did not report ready in time
    #[error("Experiment {id} did not become ready within {timeout:?}")]
    NotReady { id: ExperimentId, timeout: Duration },

    /// Experiment task exited before reporting ready
    #[error("Experiment {0} exited during restore")]
    Exited(ExperimentId),

    /// Persistence error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors addressing a supervised experiment
#[derive(Error, Debug)]
pub enum SupervisionError {
    /// No experiment with that id is supervised
    #[error("Experiment {0} is not running")]
    NotFound(ExperimentId),

    /// Experiment task is gone
    #[error("Experiment {0} is no longer accepting messages")]
    MailboxClosed(ExperimentId),
}
