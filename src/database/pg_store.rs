//! PostgreSQL implementation of the relational store contracts.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use super::ddl::{quote_identifier, DdlOperation};
use super::lock_retries::{classify_lock_timeout, WithLockRetries};
use super::{DdlExecutor, SchemaInspector};
use crate::batching::{BatchPage, BatchSource};
use crate::error::{MigrationError, Result};
use crate::models::{BatchRange, ColumnKind, OrderedKey, Predicate, Relation};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_retries: WithLockRetries,
}

fn push_key(query: &mut QueryBuilder<'_, Postgres>, key: &OrderedKey) {
    match key {
        OrderedKey::Int(value) => query.push_bind(*value),
        OrderedKey::Text(value) => query.push_bind(value.clone()),
    };
}

/// Append ` AND <predicate>` for each relation predicate
fn push_filters(query: &mut QueryBuilder<'_, Postgres>, relation: &Relation) {
    for predicate in &relation.predicates {
        query.push(" AND ");
        match predicate {
            Predicate::Eq { column, value } => {
                query.push(format!("to_jsonb({}) = ", quote_identifier(column)));
                query.push_bind(value.clone());
            }
            Predicate::IsNull { column } => {
                query.push(format!("{} IS NULL", quote_identifier(column)));
            }
            Predicate::IsNotNull { column } => {
                query.push(format!("{} IS NOT NULL", quote_identifier(column)));
            }
            Predicate::Raw(fragment) => {
                query.push(format!("({fragment})"));
            }
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool, lock_retries: WithLockRetries) -> Self {
        Self { pool, lock_retries }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_page(&self, mut query: QueryBuilder<'_, Postgres>) -> Result<Option<BatchPage>> {
        let row = query.build().fetch_one(&self.pool).await?;
        let lower: Option<Value> = row.try_get("lower_bound")?;
        let upper: Option<Value> = row.try_get("upper_bound")?;
        let rows: i64 = row.try_get("row_count")?;

        let (Some(lower), Some(upper)) = (lower, upper) else {
            return Ok(None);
        };
        let decode = |value: &Value| {
            OrderedKey::from_json(value).ok_or_else(|| {
                MigrationError::InvalidArgument(format!("batch bound {value} is not an integer or string"))
            })
        };

        Ok(Some(BatchPage {
            range: BatchRange::new(decode(&lower)?, decode(&upper)?)?,
            rows,
        }))
    }

    async fn exists(&self, sql: &str, binds: &[&str]) -> Result<bool> {
        let mut query = sqlx::query_scalar::<_, bool>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn execute_with_lock_retries(&self, operation: &DdlOperation) -> Result<()> {
        let sql = operation.to_sql();
        let name = operation.name();

        self.lock_retries
            .run(name, |attempt| {
                let pool = self.pool.clone();
                let sql = sql.clone();
                async move {
                    let mut tx = pool.begin().await?;
                    let timeout = attempt.lock_timeout.map_or(0, |t| t.as_millis());
                    sqlx::query(&format!("SET LOCAL lock_timeout TO '{timeout}ms'"))
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(&sql)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| classify_lock_timeout(e, name))?;
                    tx.commit().await?;
                    Ok::<_, MigrationError>(())
                }
            })
            .await
    }
}

#[async_trait]
impl BatchSource for PgStore {
    async fn column_kind(&self, table_name: &str, column_name: &str) -> Result<Option<ColumnKind>> {
        let data_type = sqlx::query_scalar::<_, String>(
            "SELECT data_type FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
        )
        .bind(table_name)
        .bind(column_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(data_type.as_deref().map(ColumnKind::from_data_type))
    }

    async fn next_range(
        &self,
        relation: &Relation,
        column_name: &str,
        after: Option<&OrderedKey>,
        batch_size: i64,
    ) -> Result<Option<BatchPage>> {
        let column = quote_identifier(column_name);
        let mut query = QueryBuilder::new(format!(
            "SELECT to_jsonb(MIN(c)) AS lower_bound, to_jsonb(MAX(c)) AS upper_bound, COUNT(*) AS row_count \
             FROM (SELECT {column} AS c FROM {} WHERE {column} IS NOT NULL",
            quote_identifier(&relation.table_name)
        ));
        if let Some(after) = after {
            query.push(format!(" AND {column} > "));
            push_key(&mut query, after);
        }
        push_filters(&mut query, relation);
        query.push(format!(" ORDER BY {column} LIMIT "));
        query.push_bind(batch_size);
        query.push(") page");

        debug!(table = %relation.table_name, column = column_name, "🔎 Fetching keyset page");
        self.fetch_page(query).await
    }

    async fn next_distinct_range(
        &self,
        relation: &Relation,
        column_name: &str,
        after: Option<&OrderedKey>,
        batch_size: i64,
    ) -> Result<Option<BatchPage>> {
        let column = quote_identifier(column_name);
        let table = quote_identifier(&relation.table_name);

        let mut query = QueryBuilder::new(format!(
            "WITH RECURSIVE loose_index_scan AS ((SELECT {column} AS c FROM {table} WHERE {column} IS NOT NULL"
        ));
        if let Some(after) = after {
            query.push(format!(" AND {column} > "));
            push_key(&mut query, after);
        }
        push_filters(&mut query, relation);
        query.push(format!(
            " ORDER BY {column} LIMIT 1) UNION ALL (SELECT (SELECT {column} FROM {table} \
             WHERE {column} > loose_index_scan.c"
        ));
        push_filters(&mut query, relation);
        query.push(format!(
            " ORDER BY {column} LIMIT 1) FROM loose_index_scan WHERE loose_index_scan.c IS NOT NULL)) \
             SELECT to_jsonb(MIN(c)) AS lower_bound, to_jsonb(MAX(c)) AS upper_bound, COUNT(*) AS row_count \
             FROM (SELECT c FROM loose_index_scan WHERE c IS NOT NULL LIMIT "
        ));
        query.push_bind(batch_size);
        query.push(") page");

        debug!(table = %relation.table_name, column = column_name, "🔎 Fetching loose index scan page");
        self.fetch_page(query).await
    }
}

#[async_trait]
impl SchemaInspector for PgStore {
    async fn table_exists(&self, table_name: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
            &[table_name],
        )
        .await
    }

    async fn column_exists(&self, table_name: &str, column_name: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2)",
            &[table_name, column_name],
        )
        .await
    }

    async fn index_exists(&self, table_name: &str, index_name: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1 AND indexname = $2)",
            &[table_name, index_name],
        )
        .await
    }

    async fn foreign_key_exists(&self, table_name: &str, constraint_name: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.table_constraints \
             WHERE table_schema = current_schema() AND table_name = $1 \
             AND constraint_name = $2 AND constraint_type = 'FOREIGN KEY')",
            &[table_name, constraint_name],
        )
        .await
    }
}

#[async_trait]
impl DdlExecutor for PgStore {
    async fn execute_ddl(&self, operation: &DdlOperation) -> Result<()> {
        if operation.requires_no_transaction() {
            sqlx::raw_sql(&operation.to_sql()).execute(&self.pool).await?;
            return Ok(());
        }

        if operation.requires_lock_retries() {
            return self.execute_with_lock_retries(operation).await;
        }

        sqlx::query(&operation.to_sql()).execute(&self.pool).await?;
        Ok(())
    }
}
