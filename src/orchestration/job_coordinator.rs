//! # Job Coordinator
//!
//! Operations that reach into already-scheduled work: stealing queued jobs
//! and running them inline, deleting a schedule, and handing ledger rows back
//! to the queue with fresh delays.
//!
//! A message a worker already claimed can not be removed; such a job runs to
//! completion on the worker regardless of what happens here.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::job_enqueuer::delay_for;
use crate::constants::status_groups;
use crate::error::{MigrationError, Result};
use crate::ledger::LedgerStore;
use crate::logging::{log_ledger_operation, log_scheduling_operation};
use crate::messaging::{JobMessage, JobQueue, QueueError, QueuedJob};
use crate::models::{NaturalKey, ScheduledJob};
use crate::registry::HandlerRegistry;
use crate::state_machine::{JobEvent, JobStatus};

/// Outcome of a steal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StealReport {
    /// Messages removed from the queue
    pub stolen: usize,
    /// Stolen jobs executed inline successfully
    pub executed: usize,
    /// Stolen jobs whose inline execution failed
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub rows_deleted: usize,
    pub messages_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequeueReport {
    /// Rows handed back to the queue
    pub requeued: usize,
    /// Pending messages replaced by the new submissions
    pub messages_replaced: usize,
    pub delays: Vec<Duration>,
    /// One interval past the last resubmitted job: when the next job could be
    /// slotted in. Zero when nothing was requeued.
    pub final_delay: Duration,
}

#[derive(Clone)]
pub struct JobCoordinator {
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn LedgerStore>,
    registry: HandlerRegistry,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("queue", &self.queue.queue_name())
            .field("registry", &self.registry.job_class_names())
            .finish()
    }
}

impl JobCoordinator {
    pub fn new(queue: Arc<dyn JobQueue>, ledger: Arc<dyn LedgerStore>, registry: HandlerRegistry) -> Self {
        Self {
            queue,
            ledger,
            registry,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Remove every pending message of `job_class_name` accepted by `filter`, oldest
    /// first, and run it inline when `execute` is set.
    ///
    /// A message that disappears between listing and removal was claimed by a
    /// worker and is left alone.
    #[instrument(skip(self, filter))]
    pub async fn steal<F>(&self, job_class_name: &str, filter: F, execute: bool) -> Result<StealReport>
    where
        F: Fn(&QueuedJob) -> bool + Send + Sync,
    {
        let pending = self.queue.pending_for_class(job_class_name).await?;
        let mut report = StealReport::default();

        for job in pending.into_iter().filter(|job| filter(job)) {
            self.steal_one(job, execute, &mut report).await?;
        }

        info!(
            job_class_name,
            stolen = report.stolen,
            executed = report.executed,
            failed = report.failed,
            "🥷 Stole queued jobs"
        );
        Ok(report)
    }

    /// Steal only the most recently submitted pending message of a class
    #[instrument(skip(self))]
    pub async fn steal_most_recent(&self, job_class_name: &str, execute: bool) -> Result<StealReport> {
        let mut report = StealReport::default();
        if let Some(job) = self.queue.pending_for_class(job_class_name).await?.pop() {
            self.steal_one(job, execute, &mut report).await?;
        }
        Ok(report)
    }

    /// Execute a tracked row inline, moving it through Running to Succeeded or Failed.
    ///
    /// The handler is resolved before any transition, so a missing job class
    /// leaves the row untouched. Succeeded rows are returned as they are.
    #[instrument(skip(self, job), fields(job_id = job.id, job_class_name = %job.key.job_class_name))]
    pub async fn perform_inline(&self, job: &ScheduledJob) -> Result<ScheduledJob> {
        if job.status == JobStatus::Succeeded {
            return Ok(job.clone());
        }

        let handler = self.registry.resolve(&job.key.job_class_name)?;

        let mut current = job.clone();
        if current.status == JobStatus::Failed {
            current = self.ledger.transition(current.id, JobEvent::Reset).await?;
        }
        if current.status == JobStatus::Pending {
            current = self.ledger.transition(current.id, JobEvent::Claim).await?;
        }

        match handler.perform(&current.worker_arguments()).await {
            Ok(()) => {
                // The handler may have recorded its own completion.
                if let Some(row) = self.ledger.find(current.id).await? {
                    if row.status == JobStatus::Succeeded {
                        return Ok(row);
                    }
                }
                let finished = self.ledger.transition(current.id, JobEvent::Succeed).await?;
                log_ledger_operation(
                    "perform_inline",
                    &finished.key.job_class_name,
                    Some(finished.id),
                    1,
                    finished.status.as_str(),
                );
                Ok(finished)
            }
            Err(error) => {
                let reason = format!("{error:#}");
                self.ledger
                    .transition(current.id, JobEvent::Fail(reason.clone()))
                    .await?;
                log_ledger_operation(
                    "perform_inline",
                    &current.key.job_class_name,
                    Some(current.id),
                    1,
                    JobStatus::Failed.as_str(),
                );
                Err(MigrationError::JobFailed {
                    job_class_name: current.key.job_class_name,
                    job_id: Some(current.id),
                    reason,
                })
            }
        }
    }

    /// Execute a job with no tracking row inline
    #[instrument(skip(self, arguments))]
    pub async fn perform_untracked(&self, job_class_name: &str, arguments: &[Value]) -> Result<()> {
        let handler = self.registry.resolve(job_class_name)?;
        handler
            .perform(arguments)
            .await
            .map_err(|error| MigrationError::JobFailed {
                job_class_name: job_class_name.to_string(),
                job_id: None,
                reason: format!("{error:#}"),
            })
    }

    /// Delete every tracking row of `key` and the pending messages that referenced them.
    ///
    /// With no rows this is a successful no-op.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &NaturalKey) -> Result<DeleteReport> {
        let deleted = self.ledger.delete_by_key(key).await?;
        if deleted.is_empty() {
            debug!("Nothing scheduled for this key");
            return Ok(DeleteReport::default());
        }

        let ids: HashSet<i64> = deleted.iter().copied().collect();
        let messages_removed = self.remove_pending(&key.job_class_name, &ids).await?;
        let report = DeleteReport {
            rows_deleted: deleted.len(),
            messages_removed,
        };
        log_scheduling_operation(
            "delete",
            key,
            report.rows_deleted,
            "completed",
            Some(&format!("{messages_removed} queued messages removed")),
        );
        Ok(report)
    }

    /// Resubmit the Pending and Failed rows of `key` from the ledger, without re-scanning.
    ///
    /// Failed rows are reset first. Pending messages of those rows still in the
    /// queue are removed so each row has exactly one queued job.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn requeue_by_range(
        &self,
        key: &NaturalKey,
        interval: Duration,
        initial_delay: Duration,
        caller_id: Option<String>,
    ) -> Result<RequeueReport> {
        let rows = self.ledger.find_by_key(key, status_groups::REQUEUEABLE).await?;
        let mut report = RequeueReport::default();
        if rows.is_empty() {
            return Ok(report);
        }

        let rows = self.reset_failed(rows).await?;
        let ids: HashSet<i64> = rows.iter().map(|row| row.id).collect();
        report.messages_replaced = self.remove_pending(&key.job_class_name, &ids).await?;

        for (index, row) in rows.iter().enumerate() {
            let delay = delay_for(initial_delay, interval, index);
            self.resubmit(row, delay, caller_id.clone())
                .await
                .map_err(|e| MigrationError::SchedulingFailed {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            report.delays.push(delay);
        }

        report.requeued = rows.len();
        report.final_delay = delay_for(initial_delay, interval, report.requeued);
        log_scheduling_operation("requeue_by_range", key, report.requeued, "completed", None);
        Ok(report)
    }

    /// Resubmit the Pending rows of a whole job class, `page_size` rows per page.
    ///
    /// Row `i` (zero-based, counted across pages) gets `initial_delay + i * interval`.
    /// Paging only bounds how many rows are read at once.
    #[instrument(skip(self))]
    pub async fn requeue_class(
        &self,
        job_class_name: &str,
        interval: Duration,
        page_size: usize,
        initial_delay: Duration,
        caller_id: Option<String>,
    ) -> Result<RequeueReport> {
        if page_size == 0 {
            return Err(MigrationError::InvalidArgument(
                "page size must be greater than 0".to_string(),
            ));
        }

        let mut report = RequeueReport::default();
        let mut after_id = None;

        loop {
            let page = self
                .ledger
                .find_by_class(job_class_name, &[JobStatus::Pending], after_id, Some(page_size))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = Some(last.id);

            let ids: HashSet<i64> = page.iter().map(|row| row.id).collect();
            report.messages_replaced += self.remove_pending(job_class_name, &ids).await?;

            for row in &page {
                let delay = delay_for(initial_delay, interval, report.requeued);
                self.resubmit(row, delay, caller_id.clone()).await?;
                report.delays.push(delay);
                report.requeued += 1;
            }

            if page.len() < page_size {
                break;
            }
        }

        if report.requeued > 0 {
            report.final_delay = delay_for(initial_delay, interval, report.requeued);
        }

        info!(job_class_name, requeued = report.requeued, "Requeued pending jobs");
        Ok(report)
    }

    async fn steal_one(&self, job: QueuedJob, execute: bool, report: &mut StealReport) -> Result<()> {
        // Keep the message queued when it could not be executed anyway.
        if execute && !self.registry.contains(&job.message.job_class_name) {
            return Err(MigrationError::JobClassNotFound {
                job_class_name: job.message.job_class_name,
            });
        }

        if !self.queue.remove(job.handle).await? {
            debug!(handle = job.handle.0, "Message already claimed by a worker");
            return Ok(());
        }
        report.stolen += 1;

        if !execute {
            return Ok(());
        }

        let outcome = match job.message.tracking_id {
            Some(job_id) => match self.ledger.find(job_id).await? {
                Some(row) => self.perform_inline(&row).await.map(|_| ()),
                None => {
                    warn!(job_id, "Stolen job has no tracking row, running untracked");
                    self.perform_untracked(&job.message.job_class_name, &job.message.arguments)
                        .await
                }
            },
            None => {
                self.perform_untracked(&job.message.job_class_name, &job.message.arguments)
                    .await
            }
        };

        match outcome {
            Ok(()) => report.executed += 1,
            Err(MigrationError::JobFailed { reason, job_id, .. }) => {
                warn!(?job_id, %reason, "Stolen job failed inline");
                report.failed += 1;
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    async fn reset_failed(&self, rows: Vec<ScheduledJob>) -> Result<Vec<ScheduledJob>> {
        let mut reset = Vec::with_capacity(rows.len());
        for row in rows {
            if row.status == JobStatus::Failed {
                reset.push(self.ledger.transition(row.id, JobEvent::Reset).await?);
            } else {
                reset.push(row);
            }
        }
        Ok(reset)
    }

    async fn remove_pending(&self, job_class_name: &str, ids: &HashSet<i64>) -> Result<usize> {
        let mut removed = 0;
        for job in self.queue.pending_for_class(job_class_name).await? {
            let tracked = job.message.tracking_id.is_some_and(|id| ids.contains(&id));
            if tracked && self.queue.remove(job.handle).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn resubmit(
        &self,
        row: &ScheduledJob,
        delay: Duration,
        caller_id: Option<String>,
    ) -> std::result::Result<(), QueueError> {
        let message = JobMessage::new(&row.key.job_class_name, row.worker_arguments())
            .with_tracking_id(row.id)
            .with_caller_id(caller_id);
        self.queue.submit(&message, delay).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::messaging::InMemoryJobQueue;
    use parking_lot::Mutex;
    use serde_json::json;

    fn coordinator(queue: Arc<InMemoryJobQueue>) -> (JobCoordinator, Arc<Mutex<Vec<Vec<Value>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let registry = HandlerRegistry::new();
        registry.register_fn("CopyColumn", move |args| {
            recorder.lock().push(args.to_vec());
            Ok(())
        });
        let coordinator = JobCoordinator::new(queue, Arc::new(InMemoryLedger::new()), registry);
        (coordinator, seen)
    }

    async fn submit_untracked(queue: &InMemoryJobQueue, class: &str, lower: i64) {
        let message = JobMessage::new(class, vec![json!(lower), json!(lower + 9)]);
        queue.submit(&message, Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_steal_most_recent_takes_only_the_last_message() {
        let queue = Arc::new(InMemoryJobQueue::new("background_migration"));
        for lower in [1, 11, 21] {
            submit_untracked(&queue, "CopyColumn", lower).await;
        }
        let (coordinator, seen) = coordinator(Arc::clone(&queue));

        let report = coordinator.steal_most_recent("CopyColumn", true).await.unwrap();

        assert_eq!(report.stolen, 1);
        assert_eq!(report.executed, 1);
        assert_eq!(*seen.lock(), vec![vec![json!(21), json!(30)]]);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_steal_skips_messages_claimed_by_a_worker() {
        let queue = Arc::new(InMemoryJobQueue::new("background_migration"));
        submit_untracked(&queue, "CopyColumn", 1).await;
        submit_untracked(&queue, "CopyColumn", 11).await;
        let claimed = queue.claim_next("CopyColumn").unwrap();
        let (coordinator, seen) = coordinator(Arc::clone(&queue));

        let report = coordinator.steal("CopyColumn", |_| true, false).await.unwrap();

        assert_eq!(report.stolen, 1);
        assert_eq!(report.executed, 0);
        assert!(seen.lock().is_empty());
        assert!(queue.acknowledge(claimed.handle));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_filter_limits_what_is_stolen() {
        let queue = Arc::new(InMemoryJobQueue::new("background_migration"));
        submit_untracked(&queue, "CopyColumn", 1).await;
        submit_untracked(&queue, "CopyColumn", 11).await;
        let (coordinator, seen) = coordinator(Arc::clone(&queue));

        let report = coordinator
            .steal("CopyColumn", |job| job.message.arguments[0] == json!(11), true)
            .await
            .unwrap();

        assert_eq!(report.stolen, 1);
        assert_eq!(*seen.lock(), vec![vec![json!(11), json!(20)]]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_class_is_left_queued() {
        let queue = Arc::new(InMemoryJobQueue::new("background_migration"));
        submit_untracked(&queue, "DropLegacyRows", 1).await;
        let (coordinator, _) = coordinator(Arc::clone(&queue));

        let err = coordinator.steal("DropLegacyRows", |_| true, true).await.unwrap_err();

        assert!(matches!(err, MigrationError::JobClassNotFound { .. }));
        assert_eq!(queue.len(), 1);
    }
}
