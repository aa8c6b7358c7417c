//! # Error Types
//!
//! Crate-wide error taxonomy for the batched migration scheduler.
//!
//! Guard failures that simply mean "not applicable" are not errors: guards
//! return `Ok(false)` and the migration becomes a no-op. Everything in
//! [`MigrationError`] is fatal to the migration run and propagates to the
//! operator.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::guards::GuardError;
use crate::ledger::LedgerError;
use crate::messaging::QueueError;
use crate::models::NaturalKey;
use crate::state_machine::StateTransitionError;

#[derive(Error, Debug)]
pub enum MigrationError {
    /// The asynchronous execution facility rejected a submission.
    #[error("Scheduling failed for {key}: {reason}")]
    SchedulingFailed { key: NaturalKey, reason: String },

    /// A finalization gate found unfinished work it could not complete.
    #[error(
        "Batched migration {key} is not finished ({pending} pending, {running} running, {failed} failed). \
         Dependent schema changes must not proceed until it completes; re-run with finalize enabled \
         or wait for the background workers"
    )]
    IncompleteDependency {
        key: NaturalKey,
        pending: i64,
        running: i64,
        failed: i64,
    },

    #[error("No migration handler registered for job class {job_class_name}")]
    JobClassNotFound { job_class_name: String },

    /// Inline execution of a handler returned an error. `job_id` is the tracking row, if any.
    #[error("Inline execution of {job_class_name} failed (tracking id {job_id:?}): {reason}")]
    JobFailed {
        job_class_name: String,
        job_id: Option<i64>,
        reason: String,
    },

    #[error("Re-scheduling {key} would duplicate {existing} tracked jobs; delete the previous schedule first")]
    DuplicateSchedule { key: NaturalKey, existing: usize },

    #[error("{table} does not have an ID column of {column} to use for batch ranges")]
    MissingBatchColumn { table: String, column: String },

    #[error("{table}.{column} is not an integer or string column (found {data_type})")]
    InvalidBatchColumn {
        table: String,
        column: String,
        data_type: String,
    },

    #[error(
        "`{operation}` can not be run inside a transaction. \
         Run the migration with its DDL transaction disabled"
    )]
    TransactionOpen { operation: String },

    /// A statement gave up waiting for a lock (SQLSTATE 55P03).
    #[error("Lock timeout while running {operation}")]
    LockTimeout { operation: String },

    #[error("Could not acquire locks after {attempts} attempts (last lock timeout {last_timeout:?})")]
    LockRetriesExhausted {
        attempts: usize,
        last_timeout: Duration,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema migration error: {0}")]
    SchemaMigration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Guard error: {0}")]
    Guard(#[from] GuardError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),
}

impl MigrationError {
    /// Whether re-running the same migration may succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SchedulingFailed { .. }
                | Self::LockRetriesExhausted { .. }
                | Self::LockTimeout { .. }
                | Self::IncompleteDependency { .. }
                | Self::Database(_)
                | Self::Queue(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
