use async_trait::async_trait;
use std::time::Duration;

use super::errors::QueueResult;
use super::message::{JobHandle, JobMessage, QueuedJob};

/// The asynchronous execution facility, as the scheduler uses it.
///
/// Workers pull from the same queue independently; "pending" means a message
/// no worker currently holds.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Submit one job that becomes visible after `delay`
    async fn submit(&self, message: &JobMessage, delay: Duration) -> QueueResult<JobHandle>;

    /// Submit several jobs sharing one delay
    async fn bulk_submit(&self, messages: &[JobMessage], delay: Duration) -> QueueResult<Vec<JobHandle>>;

    /// Pending messages of one job class, oldest first. The class name is normalized before matching.
    async fn pending_for_class(&self, job_class_name: &str) -> QueueResult<Vec<QueuedJob>>;

    /// Remove a pending message. Returns `false` when it is gone or a worker already claimed it.
    async fn remove(&self, handle: JobHandle) -> QueueResult<bool>;
}
