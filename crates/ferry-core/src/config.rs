//! Persisted settings
//!
//! TOML configuration with serde defaults, loaded from the platform
//! config dir (`~/.config/ferry/config.toml` on Linux). Every field
//! can be overridden by front-end flags; missing files and missing
//! keys fall back to defaults.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transfer: TransferConfig,
    pub net: NetConfig,
}

/// Transfer behavior knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Wrap the stream in gzip after the handshake.
    pub compress: bool,
    /// Skip hashing when building manifests.
    pub skip_hash: bool,
    /// Cache manifests inside directory roots.
    pub cache_manifest: bool,
    /// Trust existing file lengths instead of verifying blocks.
    pub fast_resume: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compress: false,
            skip_hash: false,
            cache_manifest: true,
            fast_resume: false,
        }
    }
}

/// Reconnect policy applied by front-ends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Maximum reconnect attempts after a retryable failure.
    pub max_retries: u32,
    /// First backoff delay in seconds; doubles per attempt.
    pub retry_base_delay_secs: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay_secs: 1,
        }
    }
}

impl Config {
    /// Load from the default path, falling back to defaults on any
    /// problem.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("failed to load config from {}: {e}, using defaults", path.display());
                Self::default()
            }),
            None => {
                debug!("no config directory found, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("saved config to {}", path.display());
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "ferry", "ferry").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("no configuration directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.transfer.compress);
        assert!(config.transfer.cache_manifest);
        assert_eq!(config.net.max_retries, 5);
        assert_eq!(config.net.retry_base_delay_secs, 1);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transfer]
            compress = true
        "#,
        )
        .unwrap();
        assert!(config.transfer.compress);
        assert!(config.transfer.cache_manifest);
        assert_eq!(config.net.max_retries, 5);
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.transfer.fast_resume = true;
        config.net.max_retries = 9;

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load_from(Path::new("/nonexistent/ferry.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
