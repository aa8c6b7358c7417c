//! # Messaging Error Types
//!
//! Errors raised by the asynchronous execution facility.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The transport refused or could not accept work
    #[error("Queue unavailable: {queue_name}: {message}")]
    Unavailable { queue_name: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: message {message_id}: {message}")]
    MessageDeserialization { message_id: i64, message: String },
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn unavailable(queue_name: impl Into<String>, message: impl ToString) -> Self {
        Self::Unavailable {
            queue_name: queue_name.into(),
            message: message.to_string(),
        }
    }

    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::MessageSerialization {
            message: err.to_string(),
        }
    }
}

impl From<pgmq::errors::PgmqError> for QueueError {
    fn from(err: pgmq::errors::PgmqError) -> Self {
        Self::queue_operation("unknown", "pgmq", err)
    }
}
