//! # Ledger Schema Migrations
//!
//! Creates the tracking ledger table from `migrations/`. Concurrent runners
//! serialize on a PostgreSQL advisory lock so two processes booting at once do
//! not race on the DDL.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;

/// Advisory lock key for ledger schema setup
const LOCK_KEY: i64 = 7_311_209_447_120_031;

/// Applies the embedded ledger migrations
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Run all outstanding migrations under the advisory lock
    pub async fn run_all(pool: &PgPool) -> Result<()> {
        let mut conn = pool.acquire().await?;

        debug!("🔒 Waiting for ledger migration lock");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = sqlx::migrate!("./migrations").run(&mut *conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result?;
        info!("✅ Ledger schema is up to date");
        Ok(())
    }
}
