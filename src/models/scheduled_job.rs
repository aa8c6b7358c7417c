use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{BatchRange, NaturalKey};
use crate::state_machine::JobStatus;

/// A persisted tracking row: one scheduled range of one backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub key: NaturalKey,
    pub range: BatchRange,
    pub sub_batch_size: i64,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Arguments a worker receives for this row: the static arguments followed by the bounds.
    pub fn worker_arguments(&self) -> Vec<Value> {
        let mut arguments = self.key.job_arguments.clone();
        arguments.extend(self.range.to_arguments());
        arguments
    }

    pub fn is_unfinished(&self) -> bool {
        self.status.is_unfinished()
    }
}

/// A tracking row that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledJob {
    pub key: NaturalKey,
    pub range: BatchRange,
    pub sub_batch_size: i64,
    pub scheduled_at: DateTime<Utc>,
}

/// Per-status row counts for one natural key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.succeeded + self.failed
    }

    pub fn unfinished(&self) -> i64 {
        self.pending + self.running
    }

    /// No rows are pending, running or failed. Vacuously true for an unknown key.
    pub fn is_finished(&self) -> bool {
        self.unfinished() == 0 && self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_arguments() {
        let now = Utc::now();
        let job = ScheduledJob {
            id: 1,
            key: NaturalKey::new("FooJob", "users", "id", vec![json!("static")]),
            range: BatchRange::new(1, 1000).unwrap(),
            sub_batch_size: 100,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            scheduled_at: now,
            updated_at: now,
        };
        assert_eq!(job.worker_arguments(), vec![json!("static"), json!(1), json!(1000)]);
        assert!(job.is_unfinished());
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        assert!(counts.is_finished());
        counts.add(JobStatus::Succeeded, 3);
        counts.add(JobStatus::Running, 1);
        assert_eq!(counts.total(), 4);
        assert!(!counts.is_finished());
        counts.running = 0;
        counts.add(JobStatus::Failed, 1);
        assert_eq!(counts.unfinished(), 0);
        assert!(!counts.is_finished());
    }
}
