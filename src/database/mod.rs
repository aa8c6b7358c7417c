//! # Database Layer
//!
//! The relational store as the scheduler sees it:
//!
//! - [`BatchSource`](crate::batching::BatchSource): ordered range queries for the batcher
//! - [`SchemaInspector`]: side-effect-free existence checks used by guards
//! - [`DdlExecutor`]: the small fixed set of idempotent DDL operations
//!
//! [`PgStore`] implements all three against PostgreSQL, [`InMemoryStore`]
//! models tables, rows and schema objects in memory.

pub mod connection;
pub mod ddl;
pub mod in_memory_store;
pub mod lock_retries;
pub mod migrations;
pub mod pg_store;

use async_trait::async_trait;

use crate::error::Result;

pub use connection::DatabaseConnection;
pub use ddl::{apply_idempotent, default_index_name, DdlOperation, DdlOutcome};
pub use in_memory_store::InMemoryStore;
pub use lock_retries::{LockAttempt, WithLockRetries};
pub use migrations::DatabaseMigrations;
pub use pg_store::PgStore;

#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn table_exists(&self, table_name: &str) -> Result<bool>;

    async fn column_exists(&self, table_name: &str, column_name: &str) -> Result<bool>;

    async fn index_exists(&self, table_name: &str, index_name: &str) -> Result<bool>;

    async fn foreign_key_exists(&self, table_name: &str, constraint_name: &str) -> Result<bool>;
}

#[async_trait]
pub trait DdlExecutor: SchemaInspector {
    /// Execute one operation unconditionally. Use [`apply_idempotent`] for the checked form.
    async fn execute_ddl(&self, operation: &DdlOperation) -> Result<()>;
}
