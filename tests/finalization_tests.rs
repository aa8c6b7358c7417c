//! Finalization gate and inline execution

mod common;

use async_trait::async_trait;
use common::{Harness, BACKFILL};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use batched_migrations::constants::status_groups;
use batched_migrations::error::MigrationError;
use batched_migrations::guards::MigrationContext;
use batched_migrations::ledger::{InMemoryLedger, LedgerStore};
use batched_migrations::models::NaturalKey;
use batched_migrations::orchestration::BatchedMigrationOptions;
use batched_migrations::registry::MigrationHandler;
use batched_migrations::state_machine::{JobEvent, JobStatus};

fn key() -> NaturalKey {
    NaturalKey::new(BACKFILL, "users", "id", vec![])
}

async fn schedule(harness: &Harness, batch_size: i64) -> usize {
    harness
        .helpers
        .queue_batched_background_migration(
            &MigrationContext::new("test"),
            BACKFILL,
            "users",
            "id",
            vec![],
            BatchedMigrationOptions::default().with_batch_size(batch_size),
        )
        .await
        .unwrap()
        .submitted()
}

/// Play a worker that claims the oldest job and fails it
async fn fail_oldest_job(harness: &Harness) -> i64 {
    let claimed = harness.queue.claim_next(BACKFILL).unwrap();
    let job_id = claimed.message.tracking_id.unwrap();
    harness.ledger.transition(job_id, JobEvent::Claim).await.unwrap();
    harness
        .ledger
        .transition(job_id, JobEvent::Fail("statement timeout".into()))
        .await
        .unwrap();
    harness.queue.acknowledge(claimed.handle);
    job_id
}

#[tokio::test]
async fn test_finalize_resets_failed_row_and_runs_it_inline() {
    let harness = Harness::new().with_users(10);
    harness.register_state_backfill(BACKFILL);
    schedule(&harness, 100).await;
    let job_id = fail_oldest_job(&harness).await;

    let counts = harness
        .helpers
        .ensure_batched_background_migration_is_finished(BACKFILL, "users", "id", vec![], true)
        .await
        .unwrap();

    assert_eq!(counts.succeeded, 1);
    assert!(counts.is_finished());
    let row = harness.ledger.find(job_id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Succeeded);
    assert!(harness
        .store
        .rows("users")
        .iter()
        .all(|row| row["state"] == Value::from("active")));
}

#[tokio::test]
async fn test_second_ensure_finished_has_no_side_effects() {
    let harness = Harness::new().with_users(30);
    let calls = harness.record_calls(BACKFILL);
    schedule(&harness, 10).await;

    let helpers = &harness.helpers;
    let first = helpers
        .ensure_batched_background_migration_is_finished(BACKFILL, "users", "id", vec![], true)
        .await
        .unwrap();
    let ledger_after_first = harness.ledger.all();
    let calls_after_first = calls.lock().len();

    let second = helpers
        .ensure_batched_background_migration_is_finished(BACKFILL, "users", "id", vec![], true)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(calls_after_first, 3);
    assert_eq!(calls.lock().len(), calls_after_first);
    assert_eq!(harness.ledger.all(), ledger_after_first);
}

#[tokio::test]
async fn test_finalize_steals_queued_jobs() {
    let harness = Harness::new().with_users(25);
    let calls = harness.record_calls(BACKFILL);
    schedule(&harness, 10).await;
    assert_eq!(harness.queue.len(), 3);

    harness
        .helpers
        .ensure_batched_background_migration_is_finished(BACKFILL, "users", "id", vec![], true)
        .await
        .unwrap();

    assert!(harness.queue.is_empty());
    let bounds: Vec<(i64, i64)> = calls
        .lock()
        .iter()
        .map(|arguments| common::bounds(arguments).unwrap())
        .collect();
    assert_eq!(bounds, vec![(1, 10), (11, 20), (21, 25)]);
}

#[tokio::test]
async fn test_missing_job_class_is_fatal_and_leaves_work_queued() {
    let harness = Harness::new().with_users(20);
    schedule(&harness, 10).await;

    let err = harness
        .helpers
        .ensure_batched_background_migration_is_finished(BACKFILL, "users", "id", vec![], true)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::JobClassNotFound { .. }));
    assert_eq!(harness.queue.len(), 2);
    let pending = harness.ledger.find_by_key(&key(), &[JobStatus::Pending]).await.unwrap();
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn test_without_finalize_unfinished_work_is_incomplete() {
    let harness = Harness::new().with_users(20);
    harness.record_calls(BACKFILL);
    schedule(&harness, 10).await;

    let err = harness
        .helpers
        .ensure_batched_background_migration_is_finished(BACKFILL, "users", "id", vec![], false)
        .await
        .unwrap_err();

    match err {
        MigrationError::IncompleteDependency { pending, running, failed, .. } => {
            assert_eq!((pending, running, failed), (2, 0, 0));
        }
        other => panic!("expected IncompleteDependency, got {other}"),
    }
    // Nothing ran inline.
    assert_eq!(harness.queue.len(), 2);
}

#[tokio::test]
async fn test_without_finalize_failed_rows_fail_immediately() {
    let harness = Harness::new().with_users(5);
    schedule(&harness, 10).await;
    fail_oldest_job(&harness).await;

    let err = harness
        .helpers
        .gate()
        .ensure_finished(&key(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::IncompleteDependency { failed: 1, .. }));
}

#[tokio::test]
async fn test_rows_held_by_a_worker_block_the_gate() {
    let harness = Harness::new().with_users(20);
    harness.record_calls(BACKFILL);
    schedule(&harness, 10).await;

    let claimed = harness.queue.claim_next(BACKFILL).unwrap();
    let job_id = claimed.message.tracking_id.unwrap();
    harness.ledger.transition(job_id, JobEvent::Claim).await.unwrap();

    let err = harness
        .helpers
        .gate()
        .ensure_finished(&key(), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::IncompleteDependency { pending: 0, running: 1, .. }
    ));

    // Once the worker finishes, the gate opens.
    harness.ledger.transition(job_id, JobEvent::Succeed).await.unwrap();
    let counts = harness.helpers.gate().ensure_finished(&key(), false).await.unwrap();
    assert_eq!(counts.succeeded, 2);
}

#[tokio::test]
async fn test_handler_that_keeps_failing_surfaces_incomplete_dependency() {
    let harness = Harness::new().with_users(5);
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    harness.registry.register_fn(BACKFILL, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("column does not exist")
    });
    schedule(&harness, 10).await;

    let err = harness
        .helpers
        .gate()
        .ensure_finished(&key(), true)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::IncompleteDependency { failed: 1, .. }));
    // One stolen execution plus three inline rounds
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let rows = harness.ledger.find_by_key(&key(), status_groups::ALL).await.unwrap();
    assert_eq!(rows[0].last_error.as_deref(), Some("column does not exist"));
}

#[tokio::test]
async fn test_finalize_background_migration_cleans_up_tracking() {
    let harness = Harness::new().with_users(40);
    let calls = harness.record_calls(BACKFILL);
    schedule(&harness, 20).await;
    fail_oldest_job(&harness).await;

    let report = harness
        .helpers
        .finalize_background_migration(BACKFILL, Some(&[JobStatus::Succeeded]))
        .await
        .unwrap();

    assert_eq!(report.stolen, 1);
    assert_eq!(report.executed_inline, 2);
    assert_eq!(report.tracking_rows_deleted, 2);
    assert_eq!(calls.lock().len(), 2);
    assert!(harness.ledger.is_empty());
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn test_finalize_with_leading_colons_finishes_every_job() {
    let harness = Harness::new().with_users(40);
    let calls = harness.record_calls(BACKFILL);
    schedule(&harness, 20).await;
    let qualified = format!("::{BACKFILL}");

    harness
        .helpers
        .finalize_background_migration(&qualified, None)
        .await
        .unwrap();

    assert_eq!(calls.lock().len(), 2);
    assert!(harness.queue.is_empty());
    let rows = harness.ledger.find_by_key(&key(), status_groups::ALL).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.status == JobStatus::Succeeded));

    let deleted = harness.helpers.delete_job_tracking(&qualified, None).await.unwrap();
    assert_eq!(deleted, 2);
}

#[tokio::test]
async fn test_delete_job_tracking_defaults_to_succeeded() {
    let harness = Harness::new().with_users(40);
    harness.record_calls(BACKFILL);
    schedule(&harness, 20).await;
    harness.helpers.finalize_background_migration(BACKFILL, None).await.unwrap();

    let deleted = harness.helpers.delete_job_tracking(BACKFILL, None).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(harness.ledger.is_empty());
}

/// Records its own completion the way long-running handlers do
struct SelfTrackingHandler {
    ledger: Arc<InMemoryLedger>,
}

#[async_trait]
impl MigrationHandler for SelfTrackingHandler {
    async fn perform(&self, arguments: &[Value]) -> anyhow::Result<()> {
        self.ledger.mark_all_as_succeeded(BACKFILL, arguments).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_marking_itself_succeeded() {
    let harness = Harness::new().with_users(15);
    harness.registry.register(
        BACKFILL,
        Arc::new(SelfTrackingHandler {
            ledger: Arc::clone(&harness.ledger),
        }),
    );
    schedule(&harness, 10).await;

    let counts = harness.helpers.gate().ensure_finished(&key(), true).await.unwrap();
    assert_eq!(counts.succeeded, 2);
}
