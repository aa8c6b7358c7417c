//! PostgreSQL ledger over the `batched_migration_jobs` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use super::{LedgerError, LedgerResult, LedgerStore};
use crate::constants::LEDGER_TABLE;
use crate::models::{
    normalize_job_class_name, BatchRange, NaturalKey, NewScheduledJob, OrderedKey, ScheduledJob, StatusCounts,
};
use crate::state_machine::{JobEvent, JobStateMachine, JobStatus};

const COLUMNS: &str = "id, job_class_name, table_name, column_name, job_arguments, lower_bound, \
                       upper_bound, sub_batch_size, status, attempts, last_error, scheduled_at, updated_at";

/// Rows per multi-row INSERT, well below the bind parameter limit
const INSERT_CHUNK: usize = 1_000;

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    job_class_name: String,
    table_name: String,
    column_name: String,
    job_arguments: Value,
    lower_bound: Value,
    upper_bound: Value,
    sub_batch_size: i64,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    scheduled_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for ScheduledJob {
    type Error = LedgerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| LedgerError::Corrupt {
            job_id: row.id,
            message,
        };

        let status = row.status.parse::<JobStatus>().map_err(corrupt)?;
        let job_arguments = match row.job_arguments {
            Value::Array(arguments) => arguments,
            other => return Err(corrupt(format!("job_arguments is not an array: {other}"))),
        };
        let lower = OrderedKey::from_json(&row.lower_bound)
            .ok_or_else(|| corrupt(format!("unsupported lower bound {}", row.lower_bound)))?;
        let upper = OrderedKey::from_json(&row.upper_bound)
            .ok_or_else(|| corrupt(format!("unsupported upper bound {}", row.upper_bound)))?;
        let range = BatchRange::new(lower, upper).map_err(|e| corrupt(e.to_string()))?;

        Ok(ScheduledJob {
            id: row.id,
            key: NaturalKey {
                job_class_name: row.job_class_name,
                table_name: row.table_name,
                column_name: row.column_name,
                job_arguments,
            },
            range,
            sub_batch_size: row.sub_batch_size,
            status,
            attempts: row.attempts,
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

/// Scope builder over the ledger table
struct LedgerScope {
    query: QueryBuilder<'static, Postgres>,
    has_conditions: bool,
}

impl LedgerScope {
    fn select() -> Self {
        Self {
            query: QueryBuilder::new(format!("SELECT {COLUMNS} FROM {LEDGER_TABLE}")),
            has_conditions: false,
        }
    }

    fn add_condition(&mut self, condition: &str) {
        if self.has_conditions {
            self.query.push(" AND ");
        } else {
            self.query.push(" WHERE ");
            self.has_conditions = true;
        }
        self.query.push(condition);
    }

    fn for_key(mut self, key: &NaturalKey) -> Self {
        self.add_condition("job_class_name = ");
        self.query.push_bind(key.job_class_name.clone());
        self.add_condition("table_name = ");
        self.query.push_bind(key.table_name.clone());
        self.add_condition("column_name = ");
        self.query.push_bind(key.column_name.clone());
        self.add_condition("job_arguments = ");
        self.query.push_bind(Value::Array(key.job_arguments.clone()));
        self
    }

    fn for_class(mut self, job_class_name: &str) -> Self {
        self.add_condition("job_class_name = ");
        self.query.push_bind(normalize_job_class_name(job_class_name));
        self
    }

    fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.add_condition("status = ANY(");
        self.query.push_bind(status_names(statuses));
        self.query.push(")");
        self
    }

    fn after_id(mut self, after_id: Option<i64>) -> Self {
        if let Some(after_id) = after_id {
            self.add_condition("id > ");
            self.query.push_bind(after_id);
        }
        self
    }

    fn ordered(mut self, limit: Option<usize>) -> Self {
        self.query.push(" ORDER BY id ASC");
        if let Some(limit) = limit {
            self.query.push(" LIMIT ");
            self.query.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        self
    }

    async fn all(mut self, pool: &PgPool) -> LedgerResult<Vec<ScheduledJob>> {
        let rows = self.query.build_query_as::<LedgerRow>().fetch_all(pool).await?;
        rows.into_iter().map(ScheduledJob::try_from).collect()
    }
}

/// [`LedgerStore`] backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn insert_jobs(&self, jobs: &[NewScheduledJob]) -> LedgerResult<Vec<ScheduledJob>> {
        let mut inserted = Vec::with_capacity(jobs.len());

        for chunk in jobs.chunks(INSERT_CHUNK) {
            let mut query: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {LEDGER_TABLE} (job_class_name, table_name, column_name, job_arguments, \
                 lower_bound, upper_bound, sub_batch_size, status, scheduled_at) "
            ));
            query.push_values(chunk, |mut row, job| {
                row.push_bind(job.key.job_class_name.clone())
                    .push_bind(job.key.table_name.clone())
                    .push_bind(job.key.column_name.clone())
                    .push_bind(Value::Array(job.key.job_arguments.clone()))
                    .push_bind(job.range.lower_bound.to_json())
                    .push_bind(job.range.upper_bound.to_json())
                    .push_bind(job.sub_batch_size)
                    .push_bind(JobStatus::Pending.to_string())
                    .push_bind(job.scheduled_at);
            });
            query.push(format!(" RETURNING {COLUMNS}"));

            let rows = query.build_query_as::<LedgerRow>().fetch_all(&self.pool).await?;
            let mut jobs = rows
                .into_iter()
                .map(ScheduledJob::try_from)
                .collect::<LedgerResult<Vec<_>>>()?;
            jobs.sort_by_key(|job| job.id);
            inserted.extend(jobs);
        }

        debug!(rows = inserted.len(), "📒 Inserted tracking rows");
        Ok(inserted)
    }

    async fn find(&self, job_id: i64) -> LedgerResult<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!("SELECT {COLUMNS} FROM {LEDGER_TABLE} WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScheduledJob::try_from).transpose()
    }

    async fn find_by_key(&self, key: &NaturalKey, statuses: &[JobStatus]) -> LedgerResult<Vec<ScheduledJob>> {
        LedgerScope::select()
            .for_key(key)
            .with_statuses(statuses)
            .ordered(None)
            .all(&self.pool)
            .await
    }

    async fn find_by_class(
        &self,
        job_class_name: &str,
        statuses: &[JobStatus],
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<ScheduledJob>> {
        LedgerScope::select()
            .for_class(job_class_name)
            .with_statuses(statuses)
            .after_id(after_id)
            .ordered(limit)
            .all(&self.pool)
            .await
    }

    async fn delete_by_key(&self, key: &NaturalKey) -> LedgerResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(&format!(
            "DELETE FROM {LEDGER_TABLE} WHERE job_class_name = $1 AND table_name = $2 \
             AND column_name = $3 AND job_arguments = $4 RETURNING id"
        ))
        .bind(&key.job_class_name)
        .bind(&key.table_name)
        .bind(&key.column_name)
        .bind(Value::Array(key.job_arguments.clone()))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn delete_by_class(&self, job_class_name: &str, statuses: &[JobStatus]) -> LedgerResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {LEDGER_TABLE} WHERE job_class_name = $1 AND status = ANY($2)"
        ))
        .bind(normalize_job_class_name(job_class_name))
        .bind(status_names(statuses))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn transition(&self, job_id: i64, event: JobEvent) -> LedgerResult<ScheduledJob> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {COLUMNS} FROM {LEDGER_TABLE} WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound { job_id })?;

        let mut job = ScheduledJob::try_from(row)?;
        JobStateMachine::apply(&mut job, &event, Utc::now())
            .map_err(|source| LedgerError::Transition { job_id, source })?;

        sqlx::query(&format!(
            "UPDATE {LEDGER_TABLE} SET status = $2, attempts = $3, last_error = $4, updated_at = $5 WHERE id = $1"
        ))
        .bind(job_id)
        .bind(job.status.to_string())
        .bind(job.attempts)
        .bind(job.last_error.as_deref())
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn status_counts(&self, key: &NaturalKey) -> LedgerResult<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(&format!(
            "SELECT status, COUNT(*) FROM {LEDGER_TABLE} WHERE job_class_name = $1 AND table_name = $2 \
             AND column_name = $3 AND job_arguments = $4 GROUP BY status"
        ))
        .bind(&key.job_class_name)
        .bind(&key.table_name)
        .bind(&key.column_name)
        .bind(Value::Array(key.job_arguments.clone()))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status = status.parse::<JobStatus>().map_err(|message| LedgerError::Corrupt {
                job_id: 0,
                message,
            })?;
            counts.add(status, count);
        }
        Ok(counts)
    }

    async fn mark_all_as_succeeded(&self, job_class_name: &str, arguments: &[Value]) -> LedgerResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {LEDGER_TABLE} SET status = 'succeeded', updated_at = now() \
             WHERE job_class_name = $1 AND status IN ('pending', 'running') \
             AND job_arguments || jsonb_build_array(lower_bound, upper_bound) = $2"
        ))
        .bind(normalize_job_class_name(job_class_name))
        .bind(Value::Array(arguments.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
