//! # Scheduler Configuration
//!
//! YAML-based, environment-aware configuration for the batched migration
//! scheduler.
//!
//! ## Sources (later wins)
//!
//! 1. Built-in defaults ([`SchedulerConfig::default`])
//! 2. `config/batched_migrations.yaml`
//! 3. `config/environments/<env>.yaml`
//! 4. `BBM__<SECTION>__<KEY>` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batched_migrations::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().scheduling.default_batch_size;
//! let queue = &manager.config().queue.queue_name;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_BATCH_SIZE, DEFAULT_QUEUE_NAME, DEFAULT_SUB_BATCH_SIZE,
    JOB_BUFFER_SIZE, MINIMUM_INTERVAL,
};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub scheduling: SchedulingConfig,
    pub finalization: FinalizationConfig,
    pub queue: QueueConfig,
    pub lock_retries: LockRetryConfig,
    pub deployment: DeploymentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/batched_migrations_development".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    /// `DATABASE_URL` takes precedence over the configured url
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.url.clone())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

/// How re-scheduling an already tracked natural key is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Leave the existing schedule alone and enqueue nothing
    #[default]
    Skip,
    /// Enqueue another full schedule next to the existing one
    Additive,
    /// Fail with `DuplicateSchedule`
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub default_batch_size: i64,
    pub default_sub_batch_size: i64,
    pub max_batch_size: i64,
    pub minimum_interval_seconds: u64,
    pub job_buffer_size: usize,
    pub duplicate_policy: DuplicatePolicy,
    /// Ledger rows are written for every scheduled range
    pub track_jobs: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            minimum_interval_seconds: MINIMUM_INTERVAL.as_secs(),
            job_buffer_size: JOB_BUFFER_SIZE,
            duplicate_policy: DuplicatePolicy::default(),
            track_jobs: true,
        }
    }
}

impl SchedulingConfig {
    pub fn minimum_interval(&self) -> Duration {
        Duration::from_secs(self.minimum_interval_seconds)
    }
}

/// Polling behaviour of the finalization gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationConfig {
    pub poll_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_poll_interval_ms: u64,
    pub max_wait_seconds: u64,
    /// Inline executions of one failing row before the gate gives up
    pub max_inline_attempts: u32,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            backoff_multiplier: 2.0,
            max_poll_interval_ms: 30_000,
            max_wait_seconds: 300,
            max_inline_attempts: 3,
        }
    }
}

impl FinalizationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub queue_name: String,
    pub visibility_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            visibility_timeout_seconds: 30,
        }
    }
}

/// One step of the lock retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRetryStep {
    pub lock_timeout_ms: u64,
    pub sleep_ms: u64,
}

impl LockRetryStep {
    pub const fn new(lock_timeout_ms: u64, sleep_ms: u64) -> Self {
        Self {
            lock_timeout_ms,
            sleep_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetryConfig {
    pub enabled: bool,
    pub timing: Vec<LockRetryStep>,
    /// Run one more attempt without any lock timeout once the schedule is exhausted
    pub final_attempt_without_timeout: bool,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        let mut timing = vec![LockRetryStep::new(100, 10_000); 10];
        timing.extend([
            LockRetryStep::new(250, 180_000),
            LockRetryStep::new(500, 180_000),
            LockRetryStep::new(1_000, 180_000),
            LockRetryStep::new(5_000, 180_000),
        ]);
        Self {
            enabled: true,
            timing,
            final_attempt_without_timeout: true,
        }
    }
}

/// Deployment context handed to migration guards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub environment: String,
    /// Hosted deployment this instance belongs to, when it is one
    pub instance: Option<String>,
    pub feature_flags: HashMap<String, bool>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            instance: None,
            feature_flags: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "database configuration",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        let scheduling = &self.scheduling;
        if scheduling.default_batch_size <= 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduling.default_batch_size",
                scheduling.default_batch_size,
                "batch size must be greater than 0",
            ));
        }

        if scheduling.default_sub_batch_size <= 0
            || scheduling.default_sub_batch_size > scheduling.default_batch_size
        {
            return Err(ConfigurationError::invalid_value(
                "scheduling.default_sub_batch_size",
                scheduling.default_sub_batch_size,
                format!(
                    "sub batch size must be between 1 and the batch size ({})",
                    scheduling.default_batch_size
                ),
            ));
        }

        if scheduling.default_batch_size > scheduling.max_batch_size {
            return Err(ConfigurationError::invalid_value(
                "scheduling.max_batch_size",
                scheduling.max_batch_size,
                "max batch size must not be smaller than the default batch size",
            ));
        }

        if scheduling.job_buffer_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduling.job_buffer_size",
                "0",
                "job buffer size must be greater than 0",
            ));
        }

        if self.queue.queue_name.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "queue.queue_name",
                "queue configuration",
            ));
        }

        if !is_valid_queue_name(&self.queue.queue_name) {
            return Err(ConfigurationError::invalid_value(
                "queue.queue_name",
                &self.queue.queue_name,
                "queue names may only contain lowercase letters, digits and underscores (max 47 characters)",
            ));
        }

        let finalization = &self.finalization;
        if finalization.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "finalization.poll_interval_ms",
                "0",
                "poll interval must be greater than 0",
            ));
        }

        if finalization.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "finalization.backoff_multiplier",
                finalization.backoff_multiplier,
                "backoff multiplier must be at least 1.0",
            ));
        }

        if finalization.max_inline_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "finalization.max_inline_attempts",
                "0",
                "at least one inline attempt is required",
            ));
        }

        if self.lock_retries.enabled
            && self.lock_retries.timing.is_empty()
            && !self.lock_retries.final_attempt_without_timeout
        {
            return Err(ConfigurationError::invalid_value(
                "lock_retries.timing",
                "[]",
                "lock retries need at least one timed step or a final attempt without timeout",
            ));
        }

        if self.deployment.environment.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "deployment.environment",
                "deployment configuration",
            ));
        }

        Ok(())
    }
}

/// pgmq queue names become part of table names (`pgmq.q_<name>`)
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 47
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduling.default_batch_size, 1_000);
        assert_eq!(config.scheduling.minimum_interval(), Duration::from_secs(120));
        assert_eq!(config.queue.queue_name, "background_migration");
        assert_eq!(config.lock_retries.timing.len(), 14);
    }

    #[test]
    fn test_validation_rejects_inconsistent_batch_sizes() {
        let mut config = SchedulerConfig::default();
        config.scheduling.default_sub_batch_size = 5_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { ref field, .. }) if field == "scheduling.default_sub_batch_size"
        ));

        let mut config = SchedulerConfig::default();
        config.scheduling.max_batch_size = 10;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.scheduling.default_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_name_rules() {
        assert!(is_valid_queue_name("background_migration"));
        assert!(!is_valid_queue_name("Background-Migration"));
        assert!(!is_valid_queue_name(""));
        assert!(!is_valid_queue_name(&"q".repeat(48)));

        let mut config = SchedulerConfig::default();
        config.queue.queue_name = "bad name".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_policy_serde() {
        let policy: DuplicatePolicy = serde_json::from_str("\"additive\"").unwrap();
        assert_eq!(policy, DuplicatePolicy::Additive);
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Skip);
    }
}
