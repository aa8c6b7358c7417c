use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one tracked batch job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Scheduled and waiting for a worker
    #[default]
    Pending,
    /// Claimed by a worker (or by an inline executor)
    Running,
    /// Range fully processed
    Succeeded,
    /// Worker gave up; may be reset to pending
    Failed,
}

impl JobStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Check if this is an error state that may allow recovery
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Work a finalization gate still has to wait on
    pub fn is_unfinished(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// Lifecycle of one post-deployment migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    #[default]
    NotRun,
    /// A guard declined; nothing was mutated
    Skipped,
    Applying,
    Applied,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Applied | Self::Failed)
    }

    /// Terminal states that count as a successful run
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Applied)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRun => write!(f, "not_run"),
            Self::Skipped => write!(f, "skipped"),
            Self::Applying => write!(f, "applying"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_run" => Ok(Self::NotRun),
            "skipped" => Ok(Self::Skipped),
            "applying" => Ok(Self::Applying),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid migration state: {s}")),
        }
    }
}
