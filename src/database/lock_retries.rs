//! Lock acquisition with retries.
//!
//! DDL on a busy table waits for an exclusive lock, and every query behind it
//! queues too. Each attempt therefore runs in a short transaction with
//! `SET LOCAL lock_timeout`, backing off between attempts according to the
//! configured timing table; an optional last attempt runs without a timeout.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LockRetryConfig;
use crate::error::{MigrationError, Result};

/// SQLSTATE `lock_not_available`
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAttempt {
    /// 1-based attempt number
    pub number: usize,
    /// `None` runs without a lock timeout
    pub lock_timeout: Option<Duration>,
    /// Pause before the next attempt if this one times out
    pub sleep_after: Duration,
}

#[derive(Debug, Clone)]
pub struct WithLockRetries {
    config: LockRetryConfig,
}

impl WithLockRetries {
    pub fn new(config: LockRetryConfig) -> Self {
        Self { config }
    }

    /// The attempt schedule this configuration produces
    pub fn attempts(&self) -> Vec<LockAttempt> {
        if !self.config.enabled {
            return vec![LockAttempt {
                number: 1,
                lock_timeout: None,
                sleep_after: Duration::ZERO,
            }];
        }

        let mut attempts: Vec<LockAttempt> = self
            .config
            .timing
            .iter()
            .enumerate()
            .map(|(index, step)| LockAttempt {
                number: index + 1,
                lock_timeout: Some(Duration::from_millis(step.lock_timeout_ms)),
                sleep_after: Duration::from_millis(step.sleep_ms),
            })
            .collect();

        if self.config.final_attempt_without_timeout {
            attempts.push(LockAttempt {
                number: attempts.len() + 1,
                lock_timeout: None,
                sleep_after: Duration::ZERO,
            });
        }

        attempts
    }

    /// Run `attempt` until it succeeds, fails with something other than a lock
    /// timeout, or the schedule runs out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(LockAttempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let plan = self.attempts();
        let total = plan.len();

        for step in &plan {
            match attempt(*step).await {
                Ok(value) => {
                    if step.number > 1 {
                        info!(operation, attempt = step.number, "🔓 Lock acquired after retries");
                    }
                    return Ok(value);
                }
                Err(MigrationError::LockTimeout { .. }) if step.number < total => {
                    warn!(
                        operation,
                        attempt = step.number,
                        lock_timeout_ms = step.lock_timeout.map(|t| t.as_millis() as u64),
                        sleep_ms = step.sleep_after.as_millis() as u64,
                        "⏳ Lock timeout, retrying"
                    );
                    tokio::time::sleep(step.sleep_after).await;
                }
                Err(MigrationError::LockTimeout { .. }) => {
                    return Err(MigrationError::LockRetriesExhausted {
                        attempts: total,
                        last_timeout: step.lock_timeout.unwrap_or_default(),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        Err(MigrationError::LockRetriesExhausted {
            attempts: total,
            last_timeout: Duration::ZERO,
        })
    }
}

/// Translate PostgreSQL's lock timeout into [`MigrationError::LockTimeout`]
pub fn classify_lock_timeout(err: sqlx::Error, operation: &str) -> MigrationError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            MigrationError::LockTimeout {
                operation: operation.to_string(),
            }
        }
        _ => MigrationError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockRetryStep;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(final_attempt: bool) -> LockRetryConfig {
        LockRetryConfig {
            enabled: true,
            timing: vec![LockRetryStep::new(100, 1), LockRetryStep::new(200, 1)],
            final_attempt_without_timeout: final_attempt,
        }
    }

    fn lock_timeout() -> MigrationError {
        MigrationError::LockTimeout {
            operation: "add_column".to_string(),
        }
    }

    #[test]
    fn test_attempt_schedule() {
        let attempts = WithLockRetries::new(fast_config(true)).attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].lock_timeout, Some(Duration::from_millis(100)));
        assert_eq!(attempts[2].lock_timeout, None);

        let disabled = WithLockRetries::new(LockRetryConfig {
            enabled: false,
            ..fast_config(false)
        })
        .attempts();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].lock_timeout, None);
    }

    #[tokio::test]
    async fn test_retries_until_lock_is_acquired() {
        let calls = AtomicUsize::new(0);
        let result = WithLockRetries::new(fast_config(true))
            .run("add_column", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt.lock_timeout.is_some() {
                        Err(lock_timeout())
                    } else {
                        Ok(attempt.number)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_schedule_reports_last_timeout() {
        let result: Result<()> = WithLockRetries::new(fast_config(false))
            .run("add_column", |_| async { Err(lock_timeout()) })
            .await;

        assert!(matches!(
            result,
            Err(MigrationError::LockRetriesExhausted { attempts: 2, last_timeout })
                if last_timeout == Duration::from_millis(200)
        ));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = WithLockRetries::new(fast_config(true))
            .run("add_column", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MigrationError::InvalidArgument("bad column".into())) }
            })
            .await;

        assert!(matches!(result, Err(MigrationError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
