use chrono::{DateTime, Utc};

use super::{
    errors::{invalid_transition, StateTransitionResult},
    events::JobEvent,
    states::JobStatus,
};
use crate::models::ScheduledJob;

/// Transition table for tracked batch jobs.
///
/// Stateless: the ledger owns the current status and calls [`JobStateMachine::apply`]
/// while holding the row (a row lock in PostgreSQL, the store mutex in memory).
pub struct JobStateMachine;

impl JobStateMachine {
    /// Determine the status an event leads to from `current`
    pub fn determine_target_state(current: JobStatus, event: &JobEvent) -> StateTransitionResult<JobStatus> {
        let target = match (current, event) {
            (JobStatus::Pending, JobEvent::Claim) => JobStatus::Running,

            // Handlers that record their own completion succeed rows that
            // were never claimed.
            (JobStatus::Pending | JobStatus::Running, JobEvent::Succeed) => JobStatus::Succeeded,

            (JobStatus::Running, JobEvent::Fail(_)) => JobStatus::Failed,
            (JobStatus::Failed, JobEvent::Reset) => JobStatus::Pending,

            (from, event) => return Err(invalid_transition(from, event.event_type())),
        };

        Ok(target)
    }

    /// Apply an event to a job in place and return its new status
    pub fn apply(job: &mut ScheduledJob, event: &JobEvent, now: DateTime<Utc>) -> StateTransitionResult<JobStatus> {
        let target = Self::determine_target_state(job.status, event)?;

        match event {
            JobEvent::Claim => job.attempts += 1,
            JobEvent::Reset => {
                job.attempts = 0;
                job.last_error = None;
            }
            JobEvent::Fail(message) => job.last_error = Some(message.clone()),
            JobEvent::Succeed => {}
        }

        job.status = target;
        job.updated_at = now;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchRange, NaturalKey};

    fn job(status: JobStatus) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob {
            id: 7,
            key: NaturalKey::new("FooJob", "users", "id", vec![]),
            range: BatchRange::new(1, 10).unwrap(),
            sub_batch_size: 5,
            status,
            attempts: 0,
            last_error: None,
            scheduled_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_claim_fail_reset_cycle() {
        let mut job = job(JobStatus::Pending);
        let now = Utc::now();

        assert_eq!(JobStateMachine::apply(&mut job, &JobEvent::Claim, now).unwrap(), JobStatus::Running);
        assert_eq!(job.attempts, 1);

        JobStateMachine::apply(&mut job, &JobEvent::Fail("boom".into()), now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        JobStateMachine::apply(&mut job, &JobEvent::Reset, now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_invalid_transitions_leave_job_untouched() {
        let mut succeeded = job(JobStatus::Succeeded);
        assert!(JobStateMachine::apply(&mut succeeded, &JobEvent::Claim, Utc::now()).is_err());
        assert_eq!(succeeded.status, JobStatus::Succeeded);

        assert!(JobStateMachine::determine_target_state(JobStatus::Failed, &JobEvent::Claim).is_err());
        assert!(JobStateMachine::determine_target_state(JobStatus::Pending, &JobEvent::Reset).is_err());
        assert!(JobStateMachine::determine_target_state(JobStatus::Pending, &JobEvent::Fail("x".into())).is_err());
    }

    #[test]
    fn test_pending_can_succeed_directly() {
        assert_eq!(
            JobStateMachine::determine_target_state(JobStatus::Pending, &JobEvent::Succeed).unwrap(),
            JobStatus::Succeeded
        );
    }
}
