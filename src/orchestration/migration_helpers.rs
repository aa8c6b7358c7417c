//! # Background Migration Helpers
//!
//! The surface post-deployment migrations call. [`BackgroundMigrationHelpers`]
//! wires the batcher, enqueuer, coordinator and finalization gate to one
//! relational store, one ledger and one queue.
//!
//! ```rust,no_run
//! use batched_migrations::config::SchedulerConfig;
//! use batched_migrations::guards::MigrationContext;
//! use batched_migrations::orchestration::{BackgroundMigrationHelpers, BatchedMigrationOptions};
//! use batched_migrations::registry::HandlerRegistry;
//! use std::time::Duration;
//!
//! # async fn example(pool: sqlx::PgPool) -> batched_migrations::Result<()> {
//! let config = SchedulerConfig::default();
//! let helpers = BackgroundMigrationHelpers::postgres(pool, HandlerRegistry::new(), config).await?;
//! let context = MigrationContext::new("production").with_caller_id("QueueBackfillUserState");
//!
//! helpers
//!     .queue_batched_background_migration(
//!         &context,
//!         "BackfillUserState",
//!         "users",
//!         "id",
//!         vec![],
//!         BatchedMigrationOptions::default().with_job_interval(Duration::from_secs(120)),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use futures::stream::BoxStream;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::finalization_gate::{FinalizationGate, FinalizeReport};
use super::job_coordinator::{DeleteReport, JobCoordinator, RequeueReport, StealReport};
use super::job_enqueuer::{EnqueueOptions, EnqueueResult, JobEnqueuer};
use crate::batching::{BatchSource, BatchStrategy, RangeBatcher};
use crate::config::SchedulerConfig;
use crate::constants::MINIMUM_INTERVAL;
use crate::database::{
    apply_idempotent, default_index_name, DatabaseConnection, DatabaseMigrations, DdlExecutor, DdlOperation,
    DdlOutcome, PgStore, SchemaInspector, WithLockRetries,
};
use crate::error::{MigrationError, Result};
use crate::guards::MigrationContext;
use crate::ledger::{LedgerStore, PgLedger};
use crate::messaging::{JobHandle, JobQueue, PgmqJobQueue};
use crate::models::{BatchRange, MigrationJobSpec, NaturalKey, Relation, StatusCounts};
use crate::registry::HandlerRegistry;
use crate::state_machine::JobStatus;

/// Options of `queue_batched_background_migration`
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedMigrationOptions {
    pub job_interval: Duration,
    pub batch_size: Option<i64>,
    pub sub_batch_size: Option<i64>,
    pub max_batch_size: Option<i64>,
    pub initial_delay: Duration,
}

impl Default for BatchedMigrationOptions {
    fn default() -> Self {
        Self {
            job_interval: MINIMUM_INTERVAL,
            batch_size: None,
            sub_batch_size: None,
            max_batch_size: None,
            initial_delay: Duration::ZERO,
        }
    }
}

impl BatchedMigrationOptions {
    pub fn with_job_interval(mut self, job_interval: Duration) -> Self {
        self.job_interval = job_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_sub_batch_size(mut self, sub_batch_size: i64) -> Self {
        self.sub_batch_size = Some(sub_batch_size);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: i64) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

/// Options of the relation-based scheduling helpers
#[derive(Debug, Clone, PartialEq)]
pub struct RangeJobOptions {
    pub batch_size: Option<i64>,
    pub sub_batch_size: Option<i64>,
    /// Falls back to `scheduling.track_jobs`
    pub track_jobs: Option<bool>,
    pub initial_delay: Duration,
    pub other_job_arguments: Vec<Value>,
    pub primary_column_name: String,
    pub strategy: BatchStrategy,
}

impl Default for RangeJobOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            sub_batch_size: None,
            track_jobs: None,
            initial_delay: Duration::ZERO,
            other_job_arguments: Vec::new(),
            primary_column_name: "id".to_string(),
            strategy: BatchStrategy::Keyset,
        }
    }
}

impl RangeJobOptions {
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_track_jobs(mut self, track_jobs: bool) -> Self {
        self.track_jobs = Some(track_jobs);
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_other_job_arguments(mut self, other_job_arguments: Vec<Value>) -> Self {
        self.other_job_arguments = other_job_arguments;
        self
    }

    pub fn with_primary_column_name(mut self, primary_column_name: impl Into<String>) -> Self {
        self.primary_column_name = primary_column_name.into();
        self
    }

    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyOptions {
    pub name: Option<String>,
    pub referenced_column: String,
    pub on_delete: Option<String>,
    /// Validate the constraint right after adding it
    pub validate: bool,
}

impl Default for ForeignKeyOptions {
    fn default() -> Self {
        Self {
            name: None,
            referenced_column: "id".to_string(),
            on_delete: Some("cascade".to_string()),
            validate: true,
        }
    }
}

/// `fk_<table>_<column>`
pub fn default_foreign_key_name(table_name: &str, column_name: &str) -> String {
    format!("fk_{table_name}_{column_name}")
}

#[derive(Clone)]
pub struct BackgroundMigrationHelpers {
    batcher: RangeBatcher,
    enqueuer: JobEnqueuer,
    coordinator: JobCoordinator,
    gate: FinalizationGate,
    schema: Arc<dyn SchemaInspector>,
    ddl: Arc<dyn DdlExecutor>,
    ledger: Arc<dyn LedgerStore>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for BackgroundMigrationHelpers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundMigrationHelpers")
            .field("queue", &self.queue.queue_name())
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackgroundMigrationHelpers {
    /// Wire the helpers to one store that provides ranges, schema checks and DDL
    pub fn new<S>(
        store: Arc<S>,
        ledger: Arc<dyn LedgerStore>,
        queue: Arc<dyn JobQueue>,
        registry: HandlerRegistry,
        config: SchedulerConfig,
    ) -> Self
    where
        S: BatchSource + DdlExecutor + 'static,
    {
        let source: Arc<dyn BatchSource> = store.clone();
        let schema: Arc<dyn SchemaInspector> = store.clone();
        let ddl: Arc<dyn DdlExecutor> = store;

        let enqueuer = JobEnqueuer::new(Arc::clone(&queue), Arc::clone(&ledger), config.scheduling.clone());
        let coordinator = JobCoordinator::new(Arc::clone(&queue), Arc::clone(&ledger), registry);
        let gate = FinalizationGate::new(coordinator.clone(), Arc::clone(&ledger), config.finalization.clone());

        Self {
            batcher: RangeBatcher::new(source),
            enqueuer,
            coordinator,
            gate,
            schema,
            ddl,
            ledger,
            queue,
            config,
        }
    }

    /// PostgreSQL store and ledger with a pgmq queue, all on `pool`
    pub async fn postgres(pool: PgPool, registry: HandlerRegistry, config: SchedulerConfig) -> Result<Self> {
        let store = Arc::new(PgStore::new(
            pool.clone(),
            WithLockRetries::new(config.lock_retries.clone()),
        ));
        let queue = PgmqJobQueue::new(pool.clone(), config.queue.queue_name.clone()).await?;
        queue.ensure_queue().await?;

        Ok(Self::new(
            store,
            Arc::new(PgLedger::new(pool)),
            Arc::new(queue),
            registry,
            config,
        ))
    }

    /// Connect from configuration and bring the ledger schema up to date
    pub async fn connect(config: SchedulerConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        let connection = DatabaseConnection::connect(&config.database).await?;
        DatabaseMigrations::run_all(connection.pool()).await?;
        Self::postgres(connection.pool().clone(), registry, config).await
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn batcher(&self) -> &RangeBatcher {
        &self.batcher
    }

    pub fn enqueuer(&self) -> &JobEnqueuer {
        &self.enqueuer
    }

    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    pub fn gate(&self) -> &FinalizationGate {
        &self.gate
    }

    pub fn schema(&self) -> &dyn SchemaInspector {
        self.schema.as_ref()
    }

    pub fn ledger(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.ledger)
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Batch `table.column` and schedule one job per range.
    #[instrument(skip(self, context, job_arguments, options))]
    pub async fn queue_batched_background_migration(
        &self,
        context: &MigrationContext,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
        options: BatchedMigrationOptions,
    ) -> Result<EnqueueResult> {
        context.ensure_not_in_transaction("queue_batched_background_migration")?;

        let scheduling = &self.config.scheduling;
        let batch_size = options.batch_size.unwrap_or(scheduling.default_batch_size);
        let max_batch_size = options.max_batch_size.unwrap_or(scheduling.max_batch_size);
        if batch_size > max_batch_size {
            return Err(MigrationError::InvalidArgument(format!(
                "batch_size {batch_size} exceeds max_batch_size {max_batch_size}"
            )));
        }
        let sub_batch_size = options
            .sub_batch_size
            .unwrap_or(scheduling.default_sub_batch_size)
            .min(batch_size);

        let spec = MigrationJobSpec::new(job_class_name, table_name, column_name)
            .with_arguments(job_arguments)
            .with_batch_size(batch_size)
            .with_sub_batch_size(sub_batch_size)
            .with_interval(options.job_interval);
        spec.validate()?;

        let ranges = self
            .batcher
            .batches(&Relation::table(table_name), column_name, batch_size)
            .await?;
        let enqueue_options = EnqueueOptions {
            initial_delay: options.initial_delay,
            track_jobs: scheduling.track_jobs,
            caller_id: context.caller_id.clone(),
        };
        self.enqueuer.enqueue(&spec, ranges, enqueue_options).await
    }

    /// Remove every tracking row (and the still-queued jobs) of one backfill
    #[instrument(skip(self, job_arguments))]
    pub async fn delete_batched_background_migration(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
    ) -> Result<DeleteReport> {
        let key = NaturalKey::new(job_class_name, table_name, column_name, job_arguments);
        self.coordinator.delete(&key).await
    }

    /// Precondition for migrations that depend on the backfill being complete
    #[instrument(skip(self, job_arguments))]
    pub async fn ensure_batched_background_migration_is_finished(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
        finalize: bool,
    ) -> Result<StatusCounts> {
        let key = NaturalKey::new(job_class_name, table_name, column_name, job_arguments);
        self.gate.ensure_finished(&key, finalize).await
    }

    /// Batch `relation` and schedule one job per range, `interval` apart
    #[instrument(skip(self, context, relation, options), fields(table_name = %relation.table_name))]
    pub async fn queue_background_migration_jobs_by_range_at_intervals(
        &self,
        context: &MigrationContext,
        relation: &Relation,
        job_class_name: &str,
        interval: Duration,
        options: RangeJobOptions,
    ) -> Result<EnqueueResult> {
        context.ensure_not_in_transaction("queue_background_migration_jobs_by_range_at_intervals")?;
        self.schedule_relation(context, relation, job_class_name, interval, options)
            .await
    }

    /// Same as the interval variant with every job visible at once, bulk submitted
    #[instrument(skip(self, context, relation, options), fields(table_name = %relation.table_name))]
    pub async fn bulk_queue_background_migration_jobs_by_range(
        &self,
        context: &MigrationContext,
        relation: &Relation,
        job_class_name: &str,
        options: RangeJobOptions,
    ) -> Result<EnqueueResult> {
        context.ensure_not_in_transaction("bulk_queue_background_migration_jobs_by_range")?;
        self.schedule_relation(context, relation, job_class_name, Duration::ZERO, options)
            .await
    }

    /// Hand the Pending rows of a job class back to the queue, one page per interval
    #[instrument(skip(self, context))]
    pub async fn requeue_background_migration_jobs_by_range_at_intervals(
        &self,
        context: &MigrationContext,
        job_class_name: &str,
        interval: Duration,
        batch_size: Option<usize>,
        initial_delay: Duration,
    ) -> Result<RequeueReport> {
        context.ensure_not_in_transaction("requeue_background_migration_jobs_by_range_at_intervals")?;
        let page_size = batch_size.unwrap_or(self.config.scheduling.job_buffer_size);
        self.coordinator
            .requeue_class(
                job_class_name,
                self.enqueuer.effective_interval(interval),
                page_size,
                initial_delay,
                context.caller_id.clone(),
            )
            .await
    }

    /// Resubmit the Pending and Failed rows of one backfill from the ledger
    #[instrument(skip(self, context, job_arguments))]
    pub async fn requeue_batched_background_migration(
        &self,
        context: &MigrationContext,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: Vec<Value>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Result<RequeueReport> {
        context.ensure_not_in_transaction("requeue_batched_background_migration")?;
        let key = NaturalKey::new(job_class_name, table_name, column_name, job_arguments);
        self.coordinator
            .requeue_by_range(
                &key,
                self.enqueuer.effective_interval(interval),
                initial_delay,
                context.caller_id.clone(),
            )
            .await
    }

    /// Execute everything left of a job class inline, then drop tracking rows in `delete_tracking`
    #[instrument(skip(self))]
    pub async fn finalize_background_migration(
        &self,
        job_class_name: &str,
        delete_tracking: Option<&[JobStatus]>,
    ) -> Result<FinalizeReport> {
        self.gate
            .finalize_background_migration(job_class_name, delete_tracking)
            .await
    }

    /// Submit one untracked job after `delay`
    #[instrument(skip(self, context, arguments))]
    pub async fn migrate_in(
        &self,
        context: &MigrationContext,
        delay: Duration,
        job_class_name: &str,
        arguments: Vec<Value>,
    ) -> Result<JobHandle> {
        self.enqueuer
            .submit_single(job_class_name, arguments, delay, context.caller_id.clone())
            .await
    }

    pub async fn migrate_async(
        &self,
        context: &MigrationContext,
        job_class_name: &str,
        arguments: Vec<Value>,
    ) -> Result<JobHandle> {
        self.migrate_in(context, Duration::ZERO, job_class_name, arguments)
            .await
    }

    #[instrument(skip(self, context, jobs), fields(jobs = jobs.len()))]
    pub async fn bulk_migrate_in(
        &self,
        context: &MigrationContext,
        delay: Duration,
        job_class_name: &str,
        jobs: Vec<Vec<Value>>,
    ) -> Result<Vec<JobHandle>> {
        self.enqueuer
            .submit_bulk(job_class_name, jobs, delay, context.caller_id.clone())
            .await
    }

    pub async fn bulk_migrate_async(
        &self,
        context: &MigrationContext,
        job_class_name: &str,
        jobs: Vec<Vec<Value>>,
    ) -> Result<Vec<JobHandle>> {
        self.bulk_migrate_in(context, Duration::ZERO, job_class_name, jobs)
            .await
    }

    /// Remove every queued job of a class without running it.
    ///
    /// Tracking rows of the removed jobs stay Pending, so a later
    /// `ensure_finished` without `finalize` keeps waiting on them. Drop them
    /// with [`Self::delete_job_tracking`] (passing `Pending`) or requeue them.
    #[instrument(skip(self))]
    pub async fn delete_queued_jobs(&self, job_class_name: &str) -> Result<StealReport> {
        self.coordinator.steal(job_class_name, |_| true, false).await
    }

    /// Delete tracking rows of a class in `statuses` (succeeded rows when `None`)
    #[instrument(skip(self))]
    pub async fn delete_job_tracking(
        &self,
        job_class_name: &str,
        statuses: Option<&[JobStatus]>,
    ) -> Result<u64> {
        let statuses = statuses.unwrap_or(&[JobStatus::Succeeded]);
        let deleted = self.ledger.delete_by_class(job_class_name, statuses).await?;
        info!(job_class_name, deleted, "Deleted job tracking rows");
        Ok(deleted)
    }

    /// Mark the unfinished rows whose worker arguments equal `arguments` as succeeded
    #[instrument(skip(self, arguments))]
    pub async fn mark_all_as_succeeded(&self, job_class_name: &str, arguments: &[Value]) -> Result<u64> {
        Ok(self.ledger.mark_all_as_succeeded(job_class_name, arguments).await?)
    }

    // ------------------------------------------------------------------
    // Idempotent DDL
    // ------------------------------------------------------------------

    #[instrument(skip(self, context, options))]
    pub async fn add_concurrent_index(
        &self,
        context: &MigrationContext,
        table_name: &str,
        columns: &[&str],
        options: IndexOptions,
    ) -> Result<DdlOutcome> {
        context.ensure_not_in_transaction("add_concurrent_index")?;
        let columns: Vec<String> = columns.iter().map(|column| column.to_string()).collect();
        let index_name = options
            .name
            .unwrap_or_else(|| default_index_name(table_name, &columns));
        let operation = DdlOperation::CreateIndex {
            table_name: table_name.to_string(),
            index_name,
            columns,
            unique: options.unique,
            where_clause: options.where_clause,
        };
        apply_idempotent(self.ddl.as_ref(), &operation).await
    }

    #[instrument(skip(self, context))]
    pub async fn remove_concurrent_index(
        &self,
        context: &MigrationContext,
        table_name: &str,
        columns: &[&str],
    ) -> Result<DdlOutcome> {
        let columns: Vec<String> = columns.iter().map(|column| column.to_string()).collect();
        let index_name = default_index_name(table_name, &columns);
        self.remove_concurrent_index_by_name(context, table_name, &index_name)
            .await
    }

    #[instrument(skip(self, context))]
    pub async fn remove_concurrent_index_by_name(
        &self,
        context: &MigrationContext,
        table_name: &str,
        index_name: &str,
    ) -> Result<DdlOutcome> {
        context.ensure_not_in_transaction("remove_concurrent_index")?;
        let operation = DdlOperation::DropIndex {
            table_name: table_name.to_string(),
            index_name: index_name.to_string(),
        };
        apply_idempotent(self.ddl.as_ref(), &operation).await
    }

    #[instrument(skip(self))]
    pub async fn add_column_if_absent(
        &self,
        table_name: &str,
        column_name: &str,
        sql_type: &str,
        default: Option<&str>,
        null: bool,
    ) -> Result<DdlOutcome> {
        let operation = DdlOperation::AddColumn {
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
            sql_type: sql_type.to_string(),
            default: default.map(str::to_string),
            null,
        };
        apply_idempotent(self.ddl.as_ref(), &operation).await
    }

    #[instrument(skip(self))]
    pub async fn remove_column_if_present(&self, table_name: &str, column_name: &str) -> Result<DdlOutcome> {
        let operation = DdlOperation::RemoveColumn {
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
        };
        apply_idempotent(self.ddl.as_ref(), &operation).await
    }

    /// Add a foreign key `NOT VALID`, then validate it unless `options.validate` is off.
    ///
    /// Returns the outcome of adding the constraint.
    #[instrument(skip(self, context, options))]
    pub async fn add_concurrent_foreign_key(
        &self,
        context: &MigrationContext,
        table_name: &str,
        referenced_table: &str,
        column_name: &str,
        options: ForeignKeyOptions,
    ) -> Result<DdlOutcome> {
        context.ensure_not_in_transaction("add_concurrent_foreign_key")?;
        let constraint_name = options
            .name
            .unwrap_or_else(|| default_foreign_key_name(table_name, column_name));
        let operation = DdlOperation::AddForeignKey {
            table_name: table_name.to_string(),
            constraint_name: constraint_name.clone(),
            column_name: column_name.to_string(),
            referenced_table: referenced_table.to_string(),
            referenced_column: options.referenced_column,
            on_delete: options.on_delete,
        };
        let outcome = apply_idempotent(self.ddl.as_ref(), &operation).await?;

        if options.validate {
            self.validate_foreign_key(table_name, &constraint_name).await?;
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn validate_foreign_key(&self, table_name: &str, constraint_name: &str) -> Result<DdlOutcome> {
        if !self.schema.foreign_key_exists(table_name, constraint_name).await? {
            return Err(MigrationError::InvalidArgument(format!(
                "foreign key {constraint_name} does not exist on {table_name}"
            )));
        }
        let operation = DdlOperation::ValidateForeignKey {
            table_name: table_name.to_string(),
            constraint_name: constraint_name.to_string(),
        };
        apply_idempotent(self.ddl.as_ref(), &operation).await
    }

    async fn schedule_relation(
        &self,
        context: &MigrationContext,
        relation: &Relation,
        job_class_name: &str,
        interval: Duration,
        options: RangeJobOptions,
    ) -> Result<EnqueueResult> {
        let scheduling = &self.config.scheduling;
        let batch_size = options.batch_size.unwrap_or(scheduling.default_batch_size);
        let sub_batch_size = options
            .sub_batch_size
            .unwrap_or(scheduling.default_sub_batch_size)
            .min(batch_size);

        let spec = MigrationJobSpec::new(job_class_name, &relation.table_name, &options.primary_column_name)
            .with_arguments(options.other_job_arguments)
            .with_batch_size(batch_size)
            .with_sub_batch_size(sub_batch_size)
            .with_interval(interval);
        spec.validate()?;

        let ranges: BoxStream<'static, Result<BatchRange>> = self
            .batcher
            .batches_with_strategy(relation, &options.primary_column_name, batch_size, options.strategy)
            .await?;
        let enqueue_options = EnqueueOptions {
            initial_delay: options.initial_delay,
            track_jobs: options.track_jobs.unwrap_or(scheduling.track_jobs),
            caller_id: context.caller_id.clone(),
        };
        self.enqueuer.enqueue(&spec, ranges, enqueue_options).await
    }
}
