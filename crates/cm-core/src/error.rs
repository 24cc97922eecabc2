//! Core error types for the cluster master

use std::path::PathBuf;
use thiserror::Error;

use crate::types::ExperimentId;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Experiment does not exist
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    /// Snapshot file could not be read or written
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot contents could not be (de)serialized
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
