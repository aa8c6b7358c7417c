use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::errors::{QueueError, QueueResult};
use super::job_queue::JobQueue;
use super::message::{JobHandle, JobMessage, QueuedJob};
use crate::models::normalize_job_class_name;

#[derive(Debug, Clone)]
struct Entry {
    message: JobMessage,
    delay: Duration,
    visible_at: DateTime<Utc>,
    claimed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    entries: BTreeMap<i64, Entry>,
}

/// Process-local [`JobQueue`] that can stand in for pgmq.
///
/// Time never advances on its own: delayed messages count as pending, and
/// [`InMemoryJobQueue::claim_next`] plays the part of a worker.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    queue_name: String,
    available: AtomicBool,
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            available: AtomicBool::new(true),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Simulate the transport going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Claim the oldest pending message of a class, as a worker would
    pub fn claim_next(&self, job_class_name: &str) -> Option<QueuedJob> {
        let job_class_name = normalize_job_class_name(job_class_name);
        let mut state = self.state.lock();
        let (id, entry) = state
            .entries
            .iter_mut()
            .find(|(_, entry)| !entry.claimed && entry.message.job_class_name == job_class_name)?;
        entry.claimed = true;
        Some(QueuedJob {
            handle: JobHandle(*id),
            message: entry.message.clone(),
            visible_at: entry.visible_at,
            read_count: 1,
        })
    }

    /// Drop a message after a worker finished it
    pub fn acknowledge(&self, handle: JobHandle) -> bool {
        self.state.lock().entries.remove(&handle.0).is_some()
    }

    /// Every message still in the queue with the delay it was submitted with
    pub fn submissions(&self) -> Vec<(JobMessage, Duration)> {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| (entry.message.clone(), entry.delay))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self, operation: &str) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::unavailable(
                &self.queue_name,
                format!("transport unavailable during {operation}"),
            ))
        }
    }

    fn push(state: &mut QueueState, message: &JobMessage, delay: Duration) -> JobHandle {
        state.next_id += 1;
        let visible_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.entries.insert(
            state.next_id,
            Entry {
                message: message.clone(),
                delay,
                visible_at,
                claimed: false,
            },
        );
        JobHandle(state.next_id)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn submit(&self, message: &JobMessage, delay: Duration) -> QueueResult<JobHandle> {
        self.ensure_available("submit")?;
        Ok(Self::push(&mut self.state.lock(), message, delay))
    }

    async fn bulk_submit(&self, messages: &[JobMessage], delay: Duration) -> QueueResult<Vec<JobHandle>> {
        self.ensure_available("bulk_submit")?;
        let mut state = self.state.lock();
        Ok(messages
            .iter()
            .map(|message| Self::push(&mut state, message, delay))
            .collect())
    }

    async fn pending_for_class(&self, job_class_name: &str) -> QueueResult<Vec<QueuedJob>> {
        self.ensure_available("pending_for_class")?;
        let job_class_name = normalize_job_class_name(job_class_name);
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.claimed && entry.message.job_class_name == job_class_name)
            .map(|(id, entry)| QueuedJob {
                handle: JobHandle(*id),
                message: entry.message.clone(),
                visible_at: entry.visible_at,
                read_count: 0,
            })
            .collect())
    }

    async fn remove(&self, handle: JobHandle) -> QueueResult<bool> {
        self.ensure_available("remove")?;
        let mut state = self.state.lock();
        match state.entries.get(&handle.0) {
            Some(entry) if !entry.claimed => {
                state.entries.remove(&handle.0);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_claimed_messages_are_not_pending_or_removable() {
        let queue = InMemoryJobQueue::new("background_migration");
        let first = queue
            .submit(&JobMessage::new("FooJob", vec![json!(1), json!(10)]), Duration::ZERO)
            .await
            .unwrap();
        queue
            .submit(&JobMessage::new("FooJob", vec![json!(11), json!(20)]), Duration::from_secs(120))
            .await
            .unwrap();
        queue
            .submit(&JobMessage::new("BarJob", vec![]), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(queue.pending_for_class("FooJob").await.unwrap().len(), 2);

        let claimed = queue.claim_next("FooJob").unwrap();
        assert_eq!(claimed.handle, first);
        assert!(!queue.remove(first).await.unwrap());
        assert_eq!(queue.pending_for_class("FooJob").await.unwrap().len(), 1);
        assert!(queue.acknowledge(first));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_transport_rejects_submission() {
        let queue = InMemoryJobQueue::new("background_migration");
        queue.set_available(false);
        let result = queue.submit(&JobMessage::new("FooJob", vec![]), Duration::ZERO).await;
        assert!(matches!(result, Err(QueueError::Unavailable { .. })));
        assert!(queue.is_empty());
    }
}
