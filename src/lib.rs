#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Batched Migrations
//!
//! Scheduler for batched background data migrations on large, live tables.
//!
//! ## Overview
//!
//! A post-deployment migration that needs to rewrite millions of rows cannot
//! do it inline without holding long locks. Instead it slices the table into
//! contiguous key ranges, submits one delayed job per range to a queue that
//! independent workers drain, and records every scheduled range in a tracking
//! ledger. Later migrations that depend on the backfilled data call the
//! finalization gate, which waits for (or forces) completion before they
//! proceed.
//!
//! ## Module Organization
//!
//! - [`batching`] - Lazy range batching over a relation (keyset and loose index scan)
//! - [`orchestration`] - Enqueuing, stealing, requeueing and the finalization gate
//! - [`ledger`] - Tracking rows, one per scheduled range
//! - [`messaging`] - The job queue (pgmq or in-memory)
//! - [`database`] - PostgreSQL store, idempotent DDL and lock retries
//! - [`guards`] - Side-effect-free "should this migration run" checks
//! - [`migration`] - Post-deployment migrations and their runner
//! - [`registry`] - Job class name to handler mapping for inline execution
//! - [`state_machine`] - Job and migration lifecycles
//! - [`config`] - Layered YAML and environment configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batched_migrations::config::ConfigManager;
//! use batched_migrations::guards::MigrationContext;
//! use batched_migrations::orchestration::BackgroundMigrationHelpers;
//! use batched_migrations::registry::HandlerRegistry;
//!
//! # async fn example() -> batched_migrations::Result<()> {
//! batched_migrations::logging::init_structured_logging();
//!
//! let manager = ConfigManager::load()?;
//! let helpers = BackgroundMigrationHelpers::connect(manager.config().clone(), HandlerRegistry::new()).await?;
//! let context = MigrationContext::from_deployment(&manager.config().deployment);
//!
//! helpers
//!     .ensure_batched_background_migration_is_finished("BackfillUserState", "users", "id", vec![], true)
//!     .await?;
//! # let _ = context;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Everything except the PostgreSQL adapters runs against the in-memory
//! store, ledger and queue:
//!
//! ```bash
//! cargo test                      # Unit and in-memory integration tests
//! cargo test -- --ignored         # PostgreSQL tests (needs DATABASE_URL with pgmq)
//! ```

pub mod batching;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod guards;
pub mod ledger;
pub mod logging;
pub mod messaging;
pub mod migration;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use batching::{BatchSource, BatchStrategy, RangeBatcher};
pub use config::{ConfigManager, DuplicatePolicy, SchedulerConfig};
pub use constants::status_groups;
pub use error::{MigrationError, Result};
pub use guards::{GuardDecision, GuardSet, MigrationContext, MigrationGuard};
pub use ledger::{InMemoryLedger, LedgerStore, PgLedger};
pub use messaging::{InMemoryJobQueue, JobMessage, JobQueue, PgmqJobQueue};
pub use migration::{MigrationReport, MigrationRunner, PostMigration, Reversibility};
pub use models::{BatchRange, MigrationJobSpec, NaturalKey, OrderedKey, Relation, ScheduledJob, StatusCounts};
pub use orchestration::{
    BackgroundMigrationHelpers, BatchedMigrationOptions, EnqueueOptions, EnqueueResult, FinalizationGate,
    JobCoordinator, JobEnqueuer, RangeJobOptions,
};
pub use registry::{HandlerRegistry, MigrationHandler};
pub use state_machine::{JobEvent, JobStatus, MigrationState};
