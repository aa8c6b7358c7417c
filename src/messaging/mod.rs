//! # Messaging
//!
//! The asynchronous execution facility the scheduler submits batch jobs to.
//!
//! - [`JobQueue`]: submit / bulk submit with delay, per-class pending lookup, removal
//! - [`PgmqJobQueue`]: pgmq extension on the scheduler's own PostgreSQL pool
//! - [`InMemoryJobQueue`]: process-local queue for tests and dry runs

pub mod errors;
pub mod in_memory_queue;
pub mod job_queue;
pub mod message;
pub mod pgmq_client;

pub use errors::{QueueError, QueueResult};
pub use in_memory_queue::InMemoryJobQueue;
pub use job_queue::JobQueue;
pub use message::{JobHandle, JobMessage, QueuedJob};
pub use pgmq_client::PgmqJobQueue;
