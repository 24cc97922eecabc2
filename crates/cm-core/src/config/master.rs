//! Master daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Upper bound on experiments restored at the same time after a restart
pub const DEFAULT_MAX_CONCURRENT_RESTORES: usize = 10;

/// Configuration for the master daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Port to bind when no listener is inherited from systemd.
    /// Overwritten with the effective port once the listener is resolved.
    pub port: u16,

    /// Human-readable cluster name reported by `/info`
    pub cluster_name: String,

    /// Logging settings
    pub log: LogConfig,

    /// TLS settings for the shared listener
    pub security: SecurityConfig,

    /// Resource manager settings
    pub resource_manager: ResourceManagerConfig,

    /// Restart recovery settings
    pub recovery: RecoveryConfig,

    /// How often the cluster liveness timestamp is persisted
    #[serde(with = "duration_secs")]
    pub cluster_heartbeat_interval: Duration,

    /// Persistence settings
    pub storage: StorageConfig,

    /// Where task logs shipped to the master are written
    pub task_logs: TaskLogConfig,

    /// Protocol demultiplexer settings
    pub mux: MuxConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cluster_name: String::new(),
            log: LogConfig::default(),
            security: SecurityConfig::default(),
            resource_manager: ResourceManagerConfig::default(),
            recovery: RecoveryConfig::default(),
            cluster_heartbeat_interval: Duration::from_secs(600),
            storage: StorageConfig::default(),
            task_logs: TaskLogConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Check invariants that serde cannot express
    ///
    /// Port 0 is accepted and asks the kernel for an ephemeral port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recovery.max_concurrent_restores == 0 {
            return Err(ConfigError::Invalid(
                "recovery.max_concurrent_restores must be at least 1".to_string(),
            ));
        }

        if self.recovery.restore_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "recovery.restore_timeout must be positive".to_string(),
            ));
        }

        if self.cluster_heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cluster_heartbeat_interval must be positive".to_string(),
            ));
        }

        if self.mux.sniff_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "mux.sniff_timeout must be positive".to_string(),
            ));
        }

        let tls = &self.security.tls;
        if tls.cert.is_some() != tls.key.is_some() {
            return Err(ConfigError::Invalid(
                "security.tls.cert and security.tls.key must be set together".to_string(),
            ));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub tls: TlsConfig,
}

/// Server certificate for the shared listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: Option<PathBuf>,
    /// PEM private key
    pub key: Option<PathBuf>,
}

/// Resource manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    pub agent: AgentResourceConfig,
}

/// Agent resource manager configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentResourceConfig {
    /// Request client certificates from connecting agents
    pub require_authentication: bool,
    /// PEM bundle of CAs trusted for agent client certificates
    pub client_ca: Option<PathBuf>,
}

/// Restart recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Maximum number of experiments restored concurrently
    pub max_concurrent_restores: usize,

    /// How long a restored experiment may take to report ready
    #[serde(with = "duration_secs")]
    pub restore_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_restores: DEFAULT_MAX_CONCURRENT_RESTORES,
            restore_timeout: Duration::from_secs(30),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON snapshot file. State is kept in memory only when unset.
    pub path: Option<PathBuf>,
}

/// Task log backend selection
///
/// Unknown backend names are rejected when the config is parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskLogConfig {
    /// Persist task logs through the cluster store
    #[default]
    Store,
    /// Emit task logs as tracing events
    Tracing,
}

/// Protocol demultiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Time allowed for the TLS handshake and protocol detection
    #[serde(with = "duration_secs")]
    pub sniff_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            sniff_timeout: Duration::from_secs(10),
        }
    }
}
