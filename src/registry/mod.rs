//! # Handler Registry
//!
//! Worker-side resolution of job class names.
//!
//! The scheduler passes `job_class_name` through as an opaque token. Only the
//! inline paths (steal, finalize) need to run a job, and they resolve the name
//! here.

pub mod handler_registry;

pub use handler_registry::{FnHandler, HandlerRegistry, MigrationHandler};
