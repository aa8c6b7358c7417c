//! # Orchestration
//!
//! Scheduling, stealing and finalization of batched background migrations.
//!
//! ## Components
//!
//! - [`JobEnqueuer`]: ranges in, delayed (optionally tracked) jobs out
//! - [`JobCoordinator`]: steal, delete and requeue already-scheduled work
//! - [`FinalizationGate`]: the synchronous "is the backfill done" precondition
//! - [`BackgroundMigrationHelpers`]: the façade migrations call
//!
//! ## Flow
//!
//! ```text
//! RangeBatcher ──ranges──▶ JobEnqueuer ──rows──▶ LedgerStore
//!                              │
//!                              └──messages──▶ JobQueue ──▶ workers
//!                                                 ▲
//!                    FinalizationGate ──steal─────┘
//! ```

pub mod finalization_gate;
pub mod job_coordinator;
pub mod job_enqueuer;
pub mod migration_helpers;

pub use finalization_gate::{FinalizationGate, FinalizeReport};
pub use job_coordinator::{DeleteReport, JobCoordinator, RequeueReport, StealReport};
pub use job_enqueuer::{delay_for, EnqueueOptions, EnqueueResult, JobEnqueuer};
pub use migration_helpers::{
    default_foreign_key_name, BackgroundMigrationHelpers, BatchedMigrationOptions, ForeignKeyOptions,
    IndexOptions, RangeJobOptions,
};
