//! Loading and saving the engine's INI file.
//!
//! Settings structs live in [`super::settings`], defaults in
//! [`super::defaults`], parsing in [`super::parser`], and serialization in
//! [`super::writer`].

use ini::Ini;
use std::path::Path;
use thiserror::Error;

use super::settings::EngineConfig;
use crate::export::RetryPolicy;
use crate::resource::ResourceLimits;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    #[error("failed to write config file: {0}")]
    WriteError(std::io::Error),

    #[error("invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

impl EngineConfig {
    /// Loads configuration from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        super::parser::parse_ini(&ini)
    }

    /// Parses configuration from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigFileError::ReadError(ini::Error::Parse(e)))?;
        super::parser::parse_ini(&ini)
    }

    /// Writes configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(ConfigFileError::WriteError)?;
        }
        std::fs::write(path, self.to_ini_string()).map_err(ConfigFileError::WriteError)
    }

    /// Renders configuration as commented INI text.
    pub fn to_ini_string(&self) -> String {
        super::writer::to_config_string(self)
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.resources.max_memory, self.resources.max_cpu_cores)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.export.max_retry_attempts,
            base_delay: self.export.retry_base_delay,
            max_delay: self.export.retry_max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TaskType;
    use crate::export::ConflictPolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::load_from(&temp_dir.path().join("missing.ini")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/photobatch.ini");

        let mut config = EngineConfig::default();
        config.resources.max_memory = 3 * 1024 * 1024 * 1024;
        config.resources.max_cpu_cores = 3;
        config.processor.cache_size = 10;
        config.scheduler.requeue_max_delay = Duration::from_millis(250);
        config.export.conflict_policy = ConflictPolicy::Suffix;
        config
            .concurrency
            .limits
            .push((TaskType::Custom("thumbnail".into()), 2));

        config.save_to(&path).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let err = EngineConfig::from_ini_str("[export]\nmax_retry_attempts = zero").unwrap_err();
        assert!(err.to_string().contains("export.max_retry_attempts"));
    }

    #[test]
    fn test_derived_values() {
        let config = EngineConfig::from_ini_str(
            "[resources]\nmax_memory = 1GB\nmax_cpu_cores = 2\n[export]\nmax_retry_attempts = 4",
        )
        .unwrap();
        assert_eq!(config.resource_limits(), ResourceLimits::new(1 << 30, 2));
        assert_eq!(config.retry_policy().max_attempts, 4);
    }
}
