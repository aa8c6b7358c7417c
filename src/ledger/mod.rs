//! # Migration Tracking Ledger
//!
//! Single owner of scheduling state. One row per scheduled range, keyed by the
//! backfill's natural key `(job_class_name, table_name, column_name, job_arguments)`.
//!
//! Status changes go through [`LedgerStore::transition`], which applies the
//! [`JobStateMachine`](crate::state_machine::JobStateMachine) rules while the
//! row is held.

pub mod in_memory_ledger;
pub mod pg_ledger;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{NaturalKey, NewScheduledJob, ScheduledJob, StatusCounts};
use crate::state_machine::{JobEvent, JobStatus, StateTransitionError};

pub use in_memory_ledger::InMemoryLedger;
pub use pg_ledger::PgLedger;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Tracking row {job_id} not found")]
    NotFound { job_id: i64 },

    #[error("Tracking row {job_id}: {source}")]
    Transition {
        job_id: i64,
        #[source]
        source: StateTransitionError,
    },

    #[error("Ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Tracking row {job_id} is corrupt: {message}")]
    Corrupt { job_id: i64, message: String },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Persistence for tracking rows.
///
/// Class-level lookups compare job class names in normalized form, so
/// `"::BackfillFoo"` and `"BackfillFoo"` address the same rows.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert Pending rows, returning them with their ids in input order
    async fn insert_jobs(&self, jobs: &[NewScheduledJob]) -> LedgerResult<Vec<ScheduledJob>>;

    async fn find(&self, job_id: i64) -> LedgerResult<Option<ScheduledJob>>;

    /// Rows of one natural key in the given statuses, ordered by id
    async fn find_by_key(&self, key: &NaturalKey, statuses: &[JobStatus]) -> LedgerResult<Vec<ScheduledJob>>;

    /// Rows of one job class in the given statuses with `id > after_id`, ordered by id
    async fn find_by_class(
        &self,
        job_class_name: &str,
        statuses: &[JobStatus],
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<ScheduledJob>>;

    /// Delete every row of a natural key, returning the deleted ids
    async fn delete_by_key(&self, key: &NaturalKey) -> LedgerResult<Vec<i64>>;

    /// Delete rows of a job class in the given statuses, returning the count
    async fn delete_by_class(&self, job_class_name: &str, statuses: &[JobStatus]) -> LedgerResult<u64>;

    /// Apply a lifecycle event to one row
    async fn transition(&self, job_id: i64, event: JobEvent) -> LedgerResult<ScheduledJob>;

    async fn status_counts(&self, key: &NaturalKey) -> LedgerResult<StatusCounts>;

    /// Mark unfinished rows whose worker arguments equal `arguments` as succeeded.
    ///
    /// Used by handlers that record their own completion; returns the number of rows updated.
    async fn mark_all_as_succeeded(&self, job_class_name: &str, arguments: &[Value]) -> LedgerResult<u64>;
}
