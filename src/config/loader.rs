//! Configuration Loader
//!
//! Environment-aware configuration loading. Discovers the YAML files, layers
//! the environment overrides and `BBM__*` variables on top of the defaults,
//! then validates the result.

use super::error::{ConfigResult, ConfigurationError};
use super::SchedulerConfig;
use crate::constants::{ENV_PREFIX, ENV_VAR};
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_CONFIG_FILE: &str = "batched_migrations.yaml";

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: SchedulerConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with an explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment)?;
        if config.deployment.environment.is_empty() || config.deployment.environment == "development" {
            config.deployment.environment = environment.to_string();
        }

        config.validate()?;

        info!(
            environment = environment,
            queue = %config.queue.queue_name,
            batch_size = config.scheduling.default_batch_size,
            minimum_interval_seconds = config.scheduling.minimum_interval_seconds,
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already built configuration, validating it first
    pub fn from_config(config: SchedulerConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = config.deployment.environment.clone();
        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: PathBuf::from("config"),
        }))
    }

    fn load_and_merge_config(config_directory: &Path, environment: &str) -> ConfigResult<SchedulerConfig> {
        let defaults = Config::try_from(&SchedulerConfig::default())
            .map_err(|e| ConfigurationError::load_failed("built-in defaults", e))?;

        let base_file = config_directory.join(BASE_CONFIG_FILE);
        let environment_file = config_directory
            .join("environments")
            .join(format!("{environment}.yaml"));

        for path in [&base_file, &environment_file] {
            if path.exists() {
                debug!("Merging configuration file: {}", path.display());
            }
        }

        Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file.clone()).required(false))
            .add_source(File::from(environment_file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_failed(base_file.display().to_string(), e))?
            .try_deserialize::<SchedulerConfig>()
            .map_err(|e| ConfigurationError::load_failed(config_directory.display().to_string(), e))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `BBM_ENV || APP_ENV || 'development'`
    pub fn detect_environment() -> String {
        env::var(ENV_VAR)
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_missing_directory_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().join("absent")), "test").unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().scheduling.default_batch_size, 1_000);
        assert_eq!(manager.config().deployment.environment, "test");
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "batched_migrations.yaml",
            "scheduling:\n  default_batch_size: 5000\n  duplicate_policy: reject\nqueue:\n  queue_name: bbm_jobs\n",
        );
        write(
            dir.path(),
            "environments/test.yaml",
            "scheduling:\n  default_batch_size: 250\n  minimum_interval_seconds: 0\nfinalization:\n  poll_interval_ms: 10\n",
        );

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test").unwrap();
        let config = manager.config();
        assert_eq!(config.scheduling.default_batch_size, 250);
        assert_eq!(config.scheduling.minimum_interval_seconds, 0);
        assert_eq!(config.scheduling.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.queue.queue_name, "bbm_jobs");
        assert_eq!(config.finalization.poll_interval_ms, 10);
        assert_eq!(config.finalization.max_wait_seconds, 300);
    }

    #[test]
    fn test_invalid_file_is_rejected_by_validation() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "batched_migrations.yaml",
            "scheduling:\n  default_batch_size: 10\n  default_sub_batch_size: 20\n",
        );
        let result = ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }
}
