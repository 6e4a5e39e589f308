//! Configuration management for roboclaw-deploy

mod dashboard;
pub mod serde_utils;

pub use dashboard::{
    CloudConfig, DashboardConfig, DeployDefaults, OnboardingConfig, ServiceConfig, TunnelConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roboclaw-deploy")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
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

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(T::default())
        }
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
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: DashboardConfig = load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.tunnel.base_port, 7681);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "bind_address = \"0.0.0.0:4000\"\n\n[cloud]\npoll_interval = 1\n",
        )
        .unwrap();

        let config: DashboardConfig = load_config(&path).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:4000");
        assert_eq!(config.cloud.poll_interval, Duration::from_secs(1));
        assert_eq!(config.cloud.server_timeout, Duration::from_secs(120));
        assert_eq!(config.deploy.server_type, "cax11");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DashboardConfig::default();
        config.onboarding.ready_timeout = Duration::from_millis(2500);
        save_config(&path, &config).unwrap();

        let loaded: DashboardConfig = load_config(&path).unwrap();
        assert_eq!(loaded.onboarding.ready_timeout, Duration::from_millis(2500));
        assert_eq!(loaded.service.script_timeout, config.service.script_timeout);
    }
}
