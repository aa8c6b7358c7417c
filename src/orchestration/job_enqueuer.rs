//! # Job Enqueuer
//!
//! Turns a stream of [`BatchRange`]s into delayed jobs on the [`JobQueue`].
//!
//! The i-th range (zero-based) is submitted with
//! `delay_i = initial_delay + i * interval`. When jobs are tracked, the ledger
//! rows for a buffer are written before that buffer is submitted, so every
//! message carries its tracking id. A zero interval switches to buffered bulk
//! submission with one shared delay.
//!
//! Submission has no retry. A queue failure aborts the run with
//! [`MigrationError::SchedulingFailed`]; ranges already submitted stay
//! submitted and the next run recovers through delete-then-requeue.

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{DuplicatePolicy, SchedulingConfig};
use crate::constants::status_groups;
use crate::error::{MigrationError, Result};
use crate::ledger::LedgerStore;
use crate::logging::log_scheduling_operation;
use crate::messaging::{JobHandle, JobMessage, JobQueue, QueueError};
use crate::models::{BatchRange, MigrationJobSpec, NaturalKey, NewScheduledJob, ScheduledJob};

/// Per-call scheduling options
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub initial_delay: Duration,
    /// Write one ledger row per range
    pub track_jobs: bool,
    /// Name of the migration doing the scheduling
    pub caller_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            track_jobs: true,
            caller_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn untracked() -> Self {
        Self {
            track_jobs: false,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_caller_id(mut self, caller_id: Option<String>) -> Self {
        self.caller_id = caller_id;
        self
    }
}

/// What one `enqueue` call scheduled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueResult {
    /// Ledger rows written, empty for untracked schedules
    pub jobs: Vec<ScheduledJob>,
    pub handles: Vec<JobHandle>,
    /// Delay of each submitted job, in range order
    pub delays: Vec<Duration>,
    /// Delay of the last submitted job, zero when nothing was queued
    pub final_delay: Duration,
    /// The key already had tracking rows and the duplicate policy skipped it
    pub skipped_existing: bool,
}

impl EnqueueResult {
    pub fn submitted(&self) -> usize {
        self.handles.len()
    }
}

/// `initial_delay + interval * index`, saturating
pub fn delay_for(initial_delay: Duration, interval: Duration, index: usize) -> Duration {
    let factor = u32::try_from(index).unwrap_or(u32::MAX);
    initial_delay.saturating_add(interval.saturating_mul(factor))
}

#[derive(Clone)]
pub struct JobEnqueuer {
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn LedgerStore>,
    config: SchedulingConfig,
}

impl std::fmt::Debug for JobEnqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEnqueuer")
            .field("queue", &self.queue.queue_name())
            .field("config", &self.config)
            .finish()
    }
}

impl JobEnqueuer {
    pub fn new(queue: Arc<dyn JobQueue>, ledger: Arc<dyn LedgerStore>, config: SchedulingConfig) -> Self {
        Self { queue, ledger, config }
    }

    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    /// Non-zero intervals are raised to the configured minimum
    pub fn effective_interval(&self, interval: Duration) -> Duration {
        if interval.is_zero() {
            interval
        } else {
            interval.max(self.config.minimum_interval())
        }
    }

    /// Schedule one job per range of `ranges`.
    #[instrument(skip(self, spec, ranges, options), fields(
        job_class_name = %spec.job_class_name,
        table_name = %spec.table_name,
        column_name = %spec.column_name,
    ))]
    pub async fn enqueue(
        &self,
        spec: &MigrationJobSpec,
        mut ranges: BoxStream<'_, Result<BatchRange>>,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        spec.validate()?;
        let key = spec.natural_key();
        let interval = self.effective_interval(spec.interval);
        if interval != spec.interval {
            warn!(
                requested = ?spec.interval,
                interval = ?interval,
                "Interval raised to the configured minimum"
            );
        }

        let mut result = EnqueueResult::default();
        if options.track_jobs && self.check_duplicates(&key).await? {
            result.skipped_existing = true;
            log_scheduling_operation("enqueue", &key, 0, "skipped", Some("already scheduled"));
            return Ok(result);
        }

        let buffer_size = self.config.job_buffer_size.max(1);
        let mut buffer = Vec::with_capacity(buffer_size);
        while let Some(range) = ranges.next().await {
            buffer.push(range?);
            if buffer.len() >= buffer_size {
                self.flush(spec, &key, std::mem::take(&mut buffer), interval, &options, &mut result)
                    .await?;
            }
        }
        if !buffer.is_empty() {
            self.flush(spec, &key, buffer, interval, &options, &mut result).await?;
        }

        result.final_delay = result.delays.last().copied().unwrap_or_default();
        log_scheduling_operation(
            "enqueue",
            &key,
            result.submitted(),
            "completed",
            Some(&format!("final delay {:?}", result.final_delay)),
        );
        Ok(result)
    }

    /// Submit one untracked job
    #[instrument(skip(self, arguments))]
    pub async fn submit_single(
        &self,
        job_class_name: &str,
        arguments: Vec<Value>,
        delay: Duration,
        caller_id: Option<String>,
    ) -> Result<JobHandle> {
        let message = JobMessage::new(job_class_name, arguments).with_caller_id(caller_id);
        let handle = self.queue.submit(&message, delay).await?;
        debug!(handle = handle.0, "Submitted single job");
        Ok(handle)
    }

    /// Submit untracked jobs sharing one delay, in buffers of `job_buffer_size`
    #[instrument(skip(self, arguments), fields(jobs = arguments.len()))]
    pub async fn submit_bulk(
        &self,
        job_class_name: &str,
        arguments: Vec<Vec<Value>>,
        delay: Duration,
        caller_id: Option<String>,
    ) -> Result<Vec<JobHandle>> {
        let messages: Vec<JobMessage> = arguments
            .into_iter()
            .map(|args| JobMessage::new(job_class_name, args).with_caller_id(caller_id.clone()))
            .collect();

        let mut handles = Vec::with_capacity(messages.len());
        for chunk in messages.chunks(self.config.job_buffer_size.max(1)) {
            handles.extend(self.queue.bulk_submit(chunk, delay).await?);
        }
        Ok(handles)
    }

    /// Returns `true` when the policy says to skip this schedule
    async fn check_duplicates(&self, key: &NaturalKey) -> Result<bool> {
        let existing = self.ledger.find_by_key(key, status_groups::ALL).await?;
        if existing.is_empty() {
            return Ok(false);
        }

        match self.config.duplicate_policy {
            DuplicatePolicy::Skip => {
                info!(%key, existing = existing.len(), "Backfill already scheduled, skipping");
                Ok(true)
            }
            DuplicatePolicy::Reject => Err(MigrationError::DuplicateSchedule {
                key: key.clone(),
                existing: existing.len(),
            }),
            DuplicatePolicy::Additive => {
                warn!(
                    %key,
                    existing = existing.len(),
                    "Scheduling on top of an existing schedule; delete it first to avoid duplicate jobs"
                );
                Ok(false)
            }
        }
    }

    async fn flush(
        &self,
        spec: &MigrationJobSpec,
        key: &NaturalKey,
        ranges: Vec<BatchRange>,
        interval: Duration,
        options: &EnqueueOptions,
        result: &mut EnqueueResult,
    ) -> Result<()> {
        let messages: Vec<JobMessage> = if options.track_jobs {
            let now = Utc::now();
            let new_jobs: Vec<NewScheduledJob> = ranges
                .into_iter()
                .map(|range| NewScheduledJob {
                    key: key.clone(),
                    range,
                    sub_batch_size: spec.sub_batch_size,
                    scheduled_at: now,
                })
                .collect();
            let rows = self.ledger.insert_jobs(&new_jobs).await?;
            let messages = rows
                .iter()
                .map(|row| {
                    JobMessage::new(&spec.job_class_name, row.worker_arguments())
                        .with_tracking_id(row.id)
                        .with_caller_id(options.caller_id.clone())
                })
                .collect();
            result.jobs.extend(rows);
            messages
        } else {
            ranges
                .iter()
                .map(|range| {
                    JobMessage::new(&spec.job_class_name, spec.job_arguments_for(range))
                        .with_caller_id(options.caller_id.clone())
                })
                .collect()
        };

        let scheduling_failed = |e: QueueError| MigrationError::SchedulingFailed {
            key: key.clone(),
            reason: e.to_string(),
        };

        if interval.is_zero() {
            let handles = self
                .queue
                .bulk_submit(&messages, options.initial_delay)
                .await
                .map_err(scheduling_failed)?;
            result
                .delays
                .extend(std::iter::repeat(options.initial_delay).take(handles.len()));
            result.handles.extend(handles);
            return Ok(());
        }

        for message in &messages {
            let delay = delay_for(options.initial_delay, interval, result.handles.len());
            let handle = self
                .queue
                .submit(message, delay)
                .await
                .map_err(scheduling_failed)?;
            result.handles.push(handle);
            result.delays.push(delay);
        }
        debug!(submitted = result.handles.len(), "Flushed job buffer");
        Ok(())
    }
}
