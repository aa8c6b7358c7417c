use serde::{Deserialize, Serialize};

/// Events that move a tracked job through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// A worker or inline executor takes the job
    Claim,
    /// The range was processed
    Succeed,
    /// Processing failed with an error message
    Fail(String),
    /// Return a failed job to pending with a fresh attempt budget
    Reset,
}

impl JobEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Reset => "reset",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that drive a migration file's run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MigrationEvent {
    /// A guard declined, with its description
    Skip(String),
    Start,
    Complete,
    Fail(String),
}

impl MigrationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Skip(_) => "skip",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
        }
    }
}
