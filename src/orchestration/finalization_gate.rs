//! # Finalization Gate
//!
//! The one synchronous wait point of the scheduler. A dependent migration
//! calls [`FinalizationGate::ensure_finished`] before relying on backfilled
//! data; the gate returns only once no tracking row of the key is Pending,
//! Running or Failed, and otherwise fails the run with
//! [`MigrationError::IncompleteDependency`].
//!
//! With `finalize` set the gate drives the remaining work itself: queued
//! messages are stolen and executed inline, leftover Pending and Failed rows
//! are executed inline for up to `max_inline_attempts` rounds, and the queue
//! is swept once more for jobs re-enqueued by racing retries. Rows a worker
//! already holds are waited on with exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use super::job_coordinator::JobCoordinator;
use crate::config::FinalizationConfig;
use crate::constants::status_groups;
use crate::error::{MigrationError, Result};
use crate::ledger::LedgerStore;
use crate::logging::{log_error, log_ledger_operation};
use crate::messaging::QueuedJob;
use crate::models::{NaturalKey, ScheduledJob, StatusCounts};
use crate::state_machine::JobStatus;

/// Outcome of finalizing a whole job class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub stolen: usize,
    pub executed_inline: usize,
    pub failed_inline: usize,
    pub tracking_rows_deleted: u64,
}

#[derive(Debug, Default)]
struct InlineRound {
    executed: usize,
    failures: Vec<MigrationError>,
}

#[derive(Clone)]
pub struct FinalizationGate {
    coordinator: JobCoordinator,
    ledger: Arc<dyn LedgerStore>,
    config: FinalizationConfig,
}

impl std::fmt::Debug for FinalizationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizationGate")
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .finish()
    }
}

impl FinalizationGate {
    pub fn new(coordinator: JobCoordinator, ledger: Arc<dyn LedgerStore>, config: FinalizationConfig) -> Self {
        Self {
            coordinator,
            ledger,
            config,
        }
    }

    /// Block until every tracking row of `key` succeeded.
    ///
    /// Returns the final counts. A key that is already finished (including one
    /// with no rows at all) returns immediately without side effects.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn ensure_finished(&self, key: &NaturalKey, finalize: bool) -> Result<StatusCounts> {
        let counts = self.ledger.status_counts(key).await?;
        if counts.is_finished() {
            debug!(succeeded = counts.succeeded, "Batched migration already finished");
            return Ok(counts);
        }

        if finalize {
            self.force_completion(key).await?;
        } else if counts.failed > 0 {
            return Err(self.incomplete(key, counts));
        }

        self.wait_for_workers(key).await
    }

    /// Steal, execute inline and optionally clean up every job of a class.
    ///
    /// `delete_tracking` lists the statuses whose tracking rows are removed
    /// afterwards; `None` keeps them.
    #[instrument(skip(self))]
    pub async fn finalize_background_migration(
        &self,
        job_class_name: &str,
        delete_tracking: Option<&[JobStatus]>,
    ) -> Result<FinalizeReport> {
        let mut report = FinalizeReport::default();

        let stolen = self.coordinator.steal(job_class_name, |_| true, true).await?;
        report.stolen += stolen.stolen;
        report.executed_inline += stolen.executed;

        let mut last_failure = None;
        for attempt in 1..=self.config.max_inline_attempts {
            let rows = self
                .ledger
                .find_by_class(job_class_name, status_groups::INLINE_EXECUTABLE, None, None)
                .await?;
            if rows.is_empty() {
                break;
            }
            debug!(attempt, rows = rows.len(), "Executing remaining jobs inline");
            let round = self.run_inline(rows).await?;
            report.executed_inline += round.executed;
            report.failed_inline = round.failures.len();
            last_failure = round.failures.into_iter().last();
        }

        // Retries racing with us may have put jobs back on the queue.
        let stolen = self.coordinator.steal(job_class_name, |_| true, true).await?;
        report.stolen += stolen.stolen;
        report.executed_inline += stolen.executed;

        if let Some(failure) = last_failure {
            let failed = self
                .ledger
                .find_by_class(job_class_name, &[JobStatus::Failed], None, Some(1))
                .await?;
            if !failed.is_empty() {
                log_error(
                    "FinalizationGate",
                    "finalize_background_migration",
                    &failure.to_string(),
                    Some(job_class_name),
                );
                return Err(failure);
            }
        }

        if let Some(statuses) = delete_tracking {
            report.tracking_rows_deleted = self.ledger.delete_by_class(job_class_name, statuses).await?;
            log_ledger_operation(
                "delete_job_tracking",
                job_class_name,
                None,
                report.tracking_rows_deleted,
                "deleted",
            );
        }

        info!(
            job_class_name,
            stolen = report.stolen,
            executed_inline = report.executed_inline,
            "🏁 Background migration finalized"
        );
        Ok(report)
    }

    async fn force_completion(&self, key: &NaturalKey) -> Result<()> {
        let ids: HashSet<i64> = self
            .ledger
            .find_by_key(key, status_groups::ALL)
            .await?
            .iter()
            .map(|row| row.id)
            .collect();
        let belongs_to_key = |job: &QueuedJob| {
            job.message.tracking_id.is_some_and(|id| ids.contains(&id))
        };

        self.coordinator
            .steal(&key.job_class_name, belongs_to_key, true)
            .await?;

        for attempt in 1..=self.config.max_inline_attempts {
            let rows = self.ledger.find_by_key(key, status_groups::INLINE_EXECUTABLE).await?;
            if rows.is_empty() {
                break;
            }
            let round = self.run_inline(rows).await?;
            if !round.failures.is_empty() {
                warn!(
                    attempt,
                    failures = round.failures.len(),
                    "Inline execution left failed rows"
                );
            }
        }

        self.coordinator
            .steal(&key.job_class_name, belongs_to_key, true)
            .await?;
        Ok(())
    }

    /// Run each row inline. A missing job class aborts; handler failures are collected.
    async fn run_inline(&self, rows: Vec<ScheduledJob>) -> Result<InlineRound> {
        let mut round = InlineRound::default();
        for row in rows {
            match self.coordinator.perform_inline(&row).await {
                Ok(_) => round.executed += 1,
                Err(failure @ MigrationError::JobFailed { .. }) => round.failures.push(failure),
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(round)
    }

    /// Poll with exponential backoff until nothing is Pending or Running
    async fn wait_for_workers(&self, key: &NaturalKey) -> Result<StatusCounts> {
        let deadline = Instant::now() + self.config.max_wait();
        let mut interval = self.config.poll_interval();

        loop {
            let counts = self.ledger.status_counts(key).await?;
            if counts.is_finished() {
                info!(succeeded = counts.succeeded, "✅ Batched migration finished");
                return Ok(counts);
            }
            if counts.unfinished() == 0 {
                return Err(self.incomplete(key, counts));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.incomplete(key, counts));
            }

            debug!(
                pending = counts.pending,
                running = counts.running,
                wait = ?interval,
                "Waiting for background workers"
            );
            sleep(interval.min(deadline - now)).await;
            interval = next_poll_interval(
                interval,
                self.config.backoff_multiplier,
                self.config.max_poll_interval(),
            );
        }
    }

    fn incomplete(&self, key: &NaturalKey, counts: StatusCounts) -> MigrationError {
        let error = MigrationError::IncompleteDependency {
            key: key.clone(),
            pending: counts.pending,
            running: counts.running,
            failed: counts.failed,
        };
        log_error(
            "FinalizationGate",
            "ensure_finished",
            &error.to_string(),
            Some(&key.to_string()),
        );
        error
    }
}

fn next_poll_interval(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next = current.as_secs_f64() * multiplier.max(1.0);
    if next.is_finite() && next < max.as_secs_f64() {
        Duration::from_secs_f64(next)
    } else {
        max
    }
}
