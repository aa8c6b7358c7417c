//! # PostgreSQL Message Queue Job Queue
//!
//! [`JobQueue`] over the pgmq extension. Queue creation and sends go through
//! the pgmq crate on the shared connection pool; listing a class's pending
//! messages and the conditional removal read `pgmq.q_<name>` directly, since
//! pgmq has no call for either.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgmq::{errors::PgmqError, PGMQueue};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

use super::errors::{QueueError, QueueResult};
use super::job_queue::JobQueue;
use super::message::{JobHandle, JobMessage, QueuedJob};
use crate::config::is_valid_queue_name;
use crate::models::normalize_job_class_name;

/// pgmq-backed job queue
#[derive(Debug, Clone)]
pub struct PgmqJobQueue {
    pgmq: PGMQueue,
    pool: PgPool,
    queue_name: String,
}

impl PgmqJobQueue {
    /// Build a queue client over an existing connection pool
    pub async fn new(pool: PgPool, queue_name: impl Into<String>) -> QueueResult<Self> {
        let queue_name = queue_name.into();
        if !is_valid_queue_name(&queue_name) {
            return Err(QueueError::InvalidQueueName {
                queue_name,
                reason: "expected lowercase letters, digits and underscores".to_string(),
            });
        }

        let pgmq = PGMQueue::new_with_pool(pool.clone()).await;
        info!("✅ pgmq client created with shared pool for queue: {}", queue_name);
        Ok(Self {
            pgmq,
            pool,
            queue_name,
        })
    }

    /// Create the queue if it doesn't exist
    pub async fn ensure_queue(&self) -> QueueResult<()> {
        debug!("📋 Creating queue: {}", self.queue_name);

        self.pgmq
            .create(&self.queue_name)
            .await
            .map_err(|e| QueueError::queue_operation(&self.queue_name, "create", e))?;

        info!("✅ Queue ready: {}", self.queue_name);
        Ok(())
    }

    fn table(&self) -> String {
        format!("pgmq.q_{}", self.queue_name)
    }

    fn delay_seconds(delay: Duration) -> u64 {
        delay.as_secs() + u64::from(delay.subsec_nanos() > 0)
    }

    /// Errors the database itself raised are operation failures; anything
    /// else (pool timeout, closed connection, I/O) means the transport is gone.
    fn submission_error(&self, err: PgmqError) -> QueueError {
        match err {
            PgmqError::DatabaseError(sqlx::Error::Database(db)) => {
                QueueError::queue_operation(&self.queue_name, "send", db)
            }
            PgmqError::DatabaseError(other) => QueueError::unavailable(&self.queue_name, other),
            other => QueueError::queue_operation(&self.queue_name, "send", other),
        }
    }
}

#[async_trait]
impl JobQueue for PgmqJobQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn submit(&self, message: &JobMessage, delay: Duration) -> QueueResult<JobHandle> {
        debug!(
            "📤 Sending {} to queue: {} (delay {:?})",
            message.job_class_name, self.queue_name, delay
        );

        let msg_id = self
            .pgmq
            .send_delay(&self.queue_name, message, Self::delay_seconds(delay))
            .await
            .map_err(|e| self.submission_error(e))?;

        Ok(JobHandle(msg_id))
    }

    async fn bulk_submit(&self, messages: &[JobMessage], delay: Duration) -> QueueResult<Vec<JobHandle>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self
            .pgmq
            .send_batch_delay(&self.queue_name, messages, Self::delay_seconds(delay))
            .await
            .map_err(|e| self.submission_error(e))?;

        debug!("📤 Sent {} messages to queue: {}", ids.len(), self.queue_name);
        Ok(ids.into_iter().map(JobHandle).collect())
    }

    async fn pending_for_class(&self, job_class_name: &str) -> QueueResult<Vec<QueuedJob>> {
        // A message whose visibility timeout lapsed after a read is up for grabs again.
        let sql = format!(
            "SELECT msg_id, read_ct, vt, message FROM {} \
             WHERE message->>'job_class_name' = $1 AND (read_ct = 0 OR vt <= now()) \
             ORDER BY msg_id",
            self.table()
        );

        let rows = sqlx::query(&sql)
            .bind(normalize_job_class_name(job_class_name))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::queue_operation(&self.queue_name, "pending_for_class", e))?;

        rows.into_iter()
            .map(|row| {
                let msg_id: i64 = row
                    .try_get("msg_id")
                    .map_err(|e| QueueError::queue_operation(&self.queue_name, "decode", e))?;
                let read_count: i32 = row
                    .try_get("read_ct")
                    .map_err(|e| QueueError::queue_operation(&self.queue_name, "decode", e))?;
                let visible_at: DateTime<Utc> = row
                    .try_get("vt")
                    .map_err(|e| QueueError::queue_operation(&self.queue_name, "decode", e))?;
                let payload: serde_json::Value = row
                    .try_get("message")
                    .map_err(|e| QueueError::queue_operation(&self.queue_name, "decode", e))?;
                let message = serde_json::from_value(payload).map_err(|e| QueueError::MessageDeserialization {
                    message_id: msg_id,
                    message: e.to_string(),
                })?;

                Ok(QueuedJob {
                    handle: JobHandle(msg_id),
                    message,
                    visible_at,
                    read_count,
                })
            })
            .collect()
    }

    async fn remove(&self, handle: JobHandle) -> QueueResult<bool> {
        debug!("🗑️ Removing message {} from queue: {}", handle, self.queue_name);

        let sql = format!(
            "DELETE FROM {} WHERE msg_id = $1 AND (read_ct = 0 OR vt <= now()) RETURNING msg_id",
            self.table()
        );
        let removed = sqlx::query(&sql)
            .bind(handle.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::queue_operation(&self.queue_name, "remove", e))?;

        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_rounds_up_to_whole_seconds() {
        assert_eq!(PgmqJobQueue::delay_seconds(Duration::ZERO), 0);
        assert_eq!(PgmqJobQueue::delay_seconds(Duration::from_millis(1_500)), 2);
        assert_eq!(PgmqJobQueue::delay_seconds(Duration::from_secs(120)), 120);
    }
}
