//! # Data Models
//!
//! Value types shared by the scheduler, the tracking ledger and the queue:
//! batch ranges over an ordered key, backfill specifications with their
//! natural key, and persisted tracking rows.

pub mod batch_range;
pub mod job_spec;
pub mod relation;
pub mod scheduled_job;

pub use batch_range::{BatchRange, ColumnKind, OrderedKey};
pub use job_spec::{normalize_job_class_name, MigrationJobSpec, NaturalKey};
pub use relation::{Predicate, Relation};
pub use scheduled_job::{NewScheduledJob, ScheduledJob, StatusCounts};
