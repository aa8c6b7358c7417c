use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_SUB_BATCH_SIZE, MINIMUM_INTERVAL};
use crate::error::{MigrationError, Result};
use crate::models::BatchRange;

/// Strip the leading `::` some call sites put in front of job class names.
pub fn normalize_job_class_name(name: &str) -> String {
    name.trim().trim_start_matches("::").to_string()
}

/// Identity of one logical backfill: `(job_class_name, table_name, column_name, job_arguments)`.
///
/// Argument order is significant, so `[1, 2]` and `[2, 1]` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Vec<Value>,
}

impl NaturalKey {
    pub fn new(
        job_class_name: impl AsRef<str>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: Vec<Value>,
    ) -> Self {
        Self {
            job_class_name: normalize_job_class_name(job_class_name.as_ref()),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments = serde_json::to_string(&self.job_arguments).unwrap_or_else(|_| "[?]".to_string());
        write!(
            f,
            "{}({}.{}, {})",
            self.job_class_name, self.table_name, self.column_name, arguments
        )
    }
}

/// One logical backfill operation and the knobs that shape its schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJobSpec {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub static_arguments: Vec<Value>,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub interval: Duration,
}

impl MigrationJobSpec {
    pub fn new(
        job_class_name: impl AsRef<str>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
    ) -> Self {
        Self {
            job_class_name: normalize_job_class_name(job_class_name.as_ref()),
            table_name: table_name.into(),
            column_name: column_name.into(),
            static_arguments: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            interval: MINIMUM_INTERVAL,
        }
    }

    pub fn with_arguments(mut self, static_arguments: Vec<Value>) -> Self {
        self.static_arguments = static_arguments;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sub_batch_size(mut self, sub_batch_size: i64) -> Self {
        self.sub_batch_size = sub_batch_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_name: self.column_name.clone(),
            job_arguments: self.static_arguments.clone(),
        }
    }

    /// Arguments delivered to the worker for one range: `static_arguments ++ [lower, upper]`.
    pub fn job_arguments_for(&self, range: &BatchRange) -> Vec<Value> {
        let mut arguments = self.static_arguments.clone();
        arguments.extend(range.to_arguments());
        arguments
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_class_name.is_empty() {
            return Err(MigrationError::InvalidArgument(
                "job_class_name must not be empty".to_string(),
            ));
        }
        if self.table_name.is_empty() || self.column_name.is_empty() {
            return Err(MigrationError::InvalidArgument(format!(
                "{}: table and column names must not be empty",
                self.job_class_name
            )));
        }
        if self.batch_size <= 0 {
            return Err(MigrationError::InvalidArgument(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        if self.sub_batch_size <= 0 || self.sub_batch_size > self.batch_size {
            return Err(MigrationError::InvalidArgument(format!(
                "sub_batch_size must be in 1..={}, got {}",
                self.batch_size, self.sub_batch_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_class_name_normalization() {
        let spec = MigrationJobSpec::new("::FooJob", "users", "id");
        assert_eq!(spec.job_class_name, "FooJob");
        assert_eq!(normalize_job_class_name("  ::Gitlab::Foo "), "Gitlab::Foo");
    }

    #[test]
    fn test_natural_key_distinguishes_argument_order() {
        let a = MigrationJobSpec::new("FooJob", "users", "id").with_arguments(vec![json!(1), json!(2)]);
        let b = MigrationJobSpec::new("FooJob", "users", "id").with_arguments(vec![json!(2), json!(1)]);
        assert_ne!(a.natural_key(), b.natural_key());
        assert_eq!(a.natural_key(), a.clone().with_batch_size(5).natural_key());
    }

    #[test]
    fn test_job_arguments_append_range() {
        let spec = MigrationJobSpec::new("FooJob", "users", "id").with_arguments(vec![json!("x")]);
        let range = BatchRange::new(1, 10).unwrap();
        assert_eq!(spec.job_arguments_for(&range), vec![json!("x"), json!(1), json!(10)]);
    }

    #[test]
    fn test_validation() {
        assert!(MigrationJobSpec::new("FooJob", "users", "id").validate().is_ok());
        assert!(MigrationJobSpec::new("FooJob", "users", "id")
            .with_batch_size(0)
            .validate()
            .is_err());
        assert!(MigrationJobSpec::new("FooJob", "users", "id")
            .with_batch_size(10)
            .with_sub_batch_size(20)
            .validate()
            .is_err());
        assert!(MigrationJobSpec::new("", "users", "id").validate().is_err());
    }

    #[test]
    fn test_natural_key_display() {
        let key = NaturalKey::new("FooJob", "users", "id", vec![json!(1)]);
        assert_eq!(key.to_string(), "FooJob(users.id, [1])");
    }
}
