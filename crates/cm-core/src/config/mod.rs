//! Configuration management for the cluster master

mod master;
pub mod serde_utils;

pub use master::{
    AgentResourceConfig, LogConfig, MasterConfig, MuxConfig, RecoveryConfig,
    ResourceManagerConfig, SecurityConfig, StorageConfig, TaskLogConfig, TlsConfig,
    DEFAULT_MAX_CONCURRENT_RESTORES,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cluster-master")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("master.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration from a file, or the defaults when there is no file
///
/// A file that exists but does not parse is an error.
pub fn load_config_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        other => other,
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<MasterConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_missing_default_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: MasterConfig = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.port, MasterConfig::default().port);
    }

    #[test]
    fn test_broken_default_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "[task_logs]\ntype = \"elastic\"\n").unwrap();

        let result: Result<MasterConfig, _> = load_config_or_default(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("master.toml");

        let mut config = MasterConfig::default();
        config.port = 9443;
        config.recovery.restore_timeout = Duration::from_secs(5);
        save_config(&path, &config).unwrap();

        let loaded: MasterConfig = load_config(&path).unwrap();
        assert_eq!(loaded.port, 9443);
        assert_eq!(loaded.recovery.restore_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        std::fs::write(&path, "cluster_name = \"lab\"\n").unwrap();

        let loaded: MasterConfig = load_config(&path).unwrap();
        assert_eq!(loaded.cluster_name, "lab");
        assert_eq!(loaded.port, MasterConfig::default().port);
    }
}
