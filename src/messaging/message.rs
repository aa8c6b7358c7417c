use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::models::normalize_job_class_name;

/// Unit of work handed to the asynchronous execution facility.
///
/// `job_class_name` is an opaque token for the scheduler; workers resolve it
/// through their handler registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_class_name: String,
    pub arguments: Vec<Value>,
    /// Ledger row this message executes, when tracked
    pub tracking_id: Option<i64>,
    /// Migration that submitted the job
    pub caller_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub message_uuid: Uuid,
}

impl JobMessage {
    pub fn new(job_class_name: impl AsRef<str>, arguments: Vec<Value>) -> Self {
        Self {
            job_class_name: normalize_job_class_name(job_class_name.as_ref()),
            arguments,
            tracking_id: None,
            caller_id: None,
            enqueued_at: Utc::now(),
            message_uuid: Uuid::new_v4(),
        }
    }

    pub fn with_tracking_id(mut self, tracking_id: i64) -> Self {
        self.tracking_id = Some(tracking_id);
        self
    }

    pub fn with_caller_id(mut self, caller_id: Option<String>) -> Self {
        self.caller_id = caller_id;
        self
    }
}

/// Identifier the queue assigned to a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub i64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message still waiting in the queue (not claimed by a worker)
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub handle: JobHandle,
    pub message: JobMessage,
    pub visible_at: DateTime<Utc>,
    pub read_count: i32,
}
