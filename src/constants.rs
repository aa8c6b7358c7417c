//! # System Constants
//!
//! Defaults shared by the scheduler, derived from the values production
//! post-deployment migrations have settled on.

use std::time::Duration;

use crate::state_machine::JobStatus;

/// Rows covered by one batch (one scheduled job) when unspecified.
pub const DEFAULT_BATCH_SIZE: i64 = 1_000;

/// Rows a worker mutates per statement inside one batch.
pub const DEFAULT_SUB_BATCH_SIZE: i64 = 100;

/// Upper bound accepted for `batch_size` unless configured otherwise.
pub const DEFAULT_MAX_BATCH_SIZE: i64 = 100_000;

/// Jobs pushed to the queue per bulk submission.
pub const JOB_BUFFER_SIZE: usize = 1_000;

/// Smallest delay allowed between consecutive jobs of one schedule.
pub const MINIMUM_INTERVAL: Duration = Duration::from_secs(120);

pub const DEFAULT_QUEUE_NAME: &str = "background_migration";

pub const LEDGER_TABLE: &str = "batched_migration_jobs";

pub const ENV_VAR: &str = "BBM_ENV";

pub const ENV_PREFIX: &str = "BBM";

/// Status groupings used by ledger queries
pub mod status_groups {
    use super::JobStatus;

    /// Work a finalization gate waits on.
    pub const UNFINISHED: &[JobStatus] = &[JobStatus::Pending, JobStatus::Running];

    /// Rows that can be handed back to the queue.
    pub const REQUEUEABLE: &[JobStatus] = &[JobStatus::Pending, JobStatus::Failed];

    /// Rows a finalizer executes inline.
    pub const INLINE_EXECUTABLE: &[JobStatus] = &[JobStatus::Pending, JobStatus::Failed];

    pub const ALL: &[JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];
}
