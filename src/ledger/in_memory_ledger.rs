use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LedgerError, LedgerResult, LedgerStore};
use crate::models::{normalize_job_class_name, NaturalKey, NewScheduledJob, ScheduledJob, StatusCounts};
use crate::state_machine::{JobEvent, JobStateMachine, JobStatus};

#[derive(Debug, Default)]
struct LedgerState {
    next_id: i64,
    rows: BTreeMap<i64, ScheduledJob>,
}

/// [`LedgerStore`] kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, ordered by id
    pub fn all(&self) -> Vec<ScheduledJob> {
        self.state.read().rows.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn insert_jobs(&self, jobs: &[NewScheduledJob]) -> LedgerResult<Vec<ScheduledJob>> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(jobs.len());

        for job in jobs {
            state.next_id += 1;
            let row = ScheduledJob {
                id: state.next_id,
                key: job.key.clone(),
                range: job.range.clone(),
                sub_batch_size: job.sub_batch_size,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                scheduled_at: job.scheduled_at,
                updated_at: now,
            };
            state.rows.insert(row.id, row.clone());
            inserted.push(row);
        }

        Ok(inserted)
    }

    async fn find(&self, job_id: i64) -> LedgerResult<Option<ScheduledJob>> {
        Ok(self.state.read().rows.get(&job_id).cloned())
    }

    async fn find_by_key(&self, key: &NaturalKey, statuses: &[JobStatus]) -> LedgerResult<Vec<ScheduledJob>> {
        Ok(self
            .state
            .read()
            .rows
            .values()
            .filter(|row| &row.key == key && statuses.contains(&row.status))
            .cloned()
            .collect())
    }

    async fn find_by_class(
        &self,
        job_class_name: &str,
        statuses: &[JobStatus],
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<ScheduledJob>> {
        let job_class_name = normalize_job_class_name(job_class_name);
        let state = self.state.read();
        let start = after_id.map_or(i64::MIN, |id| id.saturating_add(1));
        Ok(state
            .rows
            .range(start..)
            .map(|(_, row)| row)
            .filter(|row| row.key.job_class_name == job_class_name && statuses.contains(&row.status))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn delete_by_key(&self, key: &NaturalKey) -> LedgerResult<Vec<i64>> {
        let mut state = self.state.write();
        let ids: Vec<i64> = state
            .rows
            .values()
            .filter(|row| &row.key == key)
            .map(|row| row.id)
            .collect();
        for id in &ids {
            state.rows.remove(id);
        }
        Ok(ids)
    }

    async fn delete_by_class(&self, job_class_name: &str, statuses: &[JobStatus]) -> LedgerResult<u64> {
        let job_class_name = normalize_job_class_name(job_class_name);
        let mut state = self.state.write();
        let before = state.rows.len();
        state
            .rows
            .retain(|_, row| !(row.key.job_class_name == job_class_name && statuses.contains(&row.status)));
        Ok((before - state.rows.len()) as u64)
    }

    async fn transition(&self, job_id: i64, event: JobEvent) -> LedgerResult<ScheduledJob> {
        let mut state = self.state.write();
        let row = state.rows.get_mut(&job_id).ok_or(LedgerError::NotFound { job_id })?;
        JobStateMachine::apply(row, &event, Utc::now())
            .map_err(|source| LedgerError::Transition { job_id, source })?;
        Ok(row.clone())
    }

    async fn status_counts(&self, key: &NaturalKey) -> LedgerResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for row in self.state.read().rows.values().filter(|row| &row.key == key) {
            counts.add(row.status, 1);
        }
        Ok(counts)
    }

    async fn mark_all_as_succeeded(&self, job_class_name: &str, arguments: &[Value]) -> LedgerResult<u64> {
        let job_class_name = normalize_job_class_name(job_class_name);
        let mut state = self.state.write();
        let now = Utc::now();
        let mut updated = 0;
        for row in state.rows.values_mut() {
            if row.key.job_class_name == job_class_name
                && row.status.is_unfinished()
                && row.worker_arguments() == arguments
            {
                JobStateMachine::apply(row, &JobEvent::Succeed, now)
                    .map_err(|source| LedgerError::Transition { job_id: row.id, source })?;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
