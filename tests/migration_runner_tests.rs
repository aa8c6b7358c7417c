//! Post-deployment migrations driven through the runner

mod common;

use async_trait::async_trait;
use common::{Harness, BACKFILL};
use std::time::Duration;

use batched_migrations::database::DdlOutcome;
use batched_migrations::error::{MigrationError, Result};
use batched_migrations::guards::{
    AlreadyScheduledGuard, EnvironmentGuard, GuardSet, MigrationContext, SchemaGuard,
};
use batched_migrations::migration::{MigrationRunner, PostMigration, Reversibility};
use batched_migrations::models::NaturalKey;
use batched_migrations::orchestration::{
    BackgroundMigrationHelpers, BatchedMigrationOptions, ForeignKeyOptions, IndexOptions,
};
use batched_migrations::state_machine::{MigrationDirection, MigrationState};

struct QueueBackfillUserState;

#[async_trait]
impl PostMigration for QueueBackfillUserState {
    fn version(&self) -> i64 {
        20240301120000
    }

    fn name(&self) -> &str {
        "QueueBackfillUserState"
    }

    fn guards(&self, helpers: &BackgroundMigrationHelpers) -> GuardSet {
        GuardSet::new()
            .with(EnvironmentGuard::only(["production"]))
            .with(AlreadyScheduledGuard::new(
                helpers.ledger(),
                NaturalKey::new(BACKFILL, "users", "id", vec![]),
            ))
    }

    fn reversibility(&self) -> Reversibility {
        Reversibility::irreversible("scheduled jobs may already have rewritten rows")
    }

    async fn up(&self, helpers: &BackgroundMigrationHelpers, context: &MigrationContext) -> Result<()> {
        helpers
            .add_concurrent_index(context, "users", &["state"], IndexOptions::default())
            .await?;
        helpers
            .queue_batched_background_migration(
                context,
                BACKFILL,
                "users",
                "id",
                vec![],
                BatchedMigrationOptions::default()
                    .with_job_interval(Duration::from_secs(120))
                    .with_batch_size(50),
            )
            .await?;
        Ok(())
    }
}

struct AddStateChangedAt;

#[async_trait]
impl PostMigration for AddStateChangedAt {
    fn version(&self) -> i64 {
        20240201000000
    }

    fn name(&self) -> &str {
        "AddStateChangedAt"
    }

    fn guards(&self, _helpers: &BackgroundMigrationHelpers) -> GuardSet {
        GuardSet::new().with(SchemaGuard::table_exists("users"))
    }

    async fn up(&self, helpers: &BackgroundMigrationHelpers, _context: &MigrationContext) -> Result<()> {
        helpers
            .add_column_if_absent("users", "state_changed_at", "timestamptz", None, true)
            .await?;
        Ok(())
    }

    async fn down(&self, helpers: &BackgroundMigrationHelpers, _context: &MigrationContext) -> Result<()> {
        helpers.remove_column_if_present("users", "state_changed_at").await?;
        Ok(())
    }
}

struct BrokenMigration;

#[async_trait]
impl PostMigration for BrokenMigration {
    fn version(&self) -> i64 {
        20240401000000
    }

    fn name(&self) -> &str {
        "BrokenMigration"
    }

    async fn up(&self, helpers: &BackgroundMigrationHelpers, context: &MigrationContext) -> Result<()> {
        helpers
            .queue_batched_background_migration(
                context,
                BACKFILL,
                "users",
                "uuid",
                vec![],
                BatchedMigrationOptions::default(),
            )
            .await?;
        Ok(())
    }
}

fn migrations() -> Vec<Box<dyn PostMigration>> {
    vec![Box::new(QueueBackfillUserState), Box::new(AddStateChangedAt)]
}

#[tokio::test]
async fn test_guarded_migration_is_a_noop_outside_its_environment() {
    let harness = Harness::new().with_users(200);
    let runner = MigrationRunner::new(harness.helpers.clone(), MigrationContext::new("test"));

    let reports = runner.run(&migrations(), MigrationDirection::Up).await.unwrap();

    let backfill = reports
        .iter()
        .find(|report| report.name == "QueueBackfillUserState")
        .unwrap();
    assert_eq!(backfill.state, MigrationState::Skipped);
    assert!(backfill.skip_reason.as_deref().unwrap().contains("production"));

    assert!(harness.ledger.is_empty());
    assert!(harness.queue.is_empty());
    // Only the unguarded column migration touched the schema.
    assert_eq!(harness.store.ddl_log().len(), 1);
    assert!(harness.store.ddl_log()[0].contains("state_changed_at"));
}

#[tokio::test]
async fn test_migrations_apply_in_version_order() {
    let harness = Harness::new().with_users(200);
    let runner = MigrationRunner::new(harness.helpers.clone(), MigrationContext::new("production"));

    let reports = runner.run(&migrations(), MigrationDirection::Up).await.unwrap();

    let names: Vec<&str> = reports.iter().map(|report| report.name.as_str()).collect();
    assert_eq!(names, vec!["AddStateChangedAt", "QueueBackfillUserState"]);
    assert!(reports.iter().all(|report| report.state == MigrationState::Applied));
    assert_eq!(harness.ledger.len(), 4);
    assert!(harness
        .queue
        .submissions()
        .iter()
        .all(|(message, _)| message.caller_id.as_deref() == Some("QueueBackfillUserState")));

    // Running again: the backfill is already scheduled and the column exists.
    let again = runner.run(&migrations(), MigrationDirection::Up).await.unwrap();
    let backfill = again
        .iter()
        .find(|report| report.name == "QueueBackfillUserState")
        .unwrap();
    assert_eq!(backfill.state, MigrationState::Skipped);
    assert_eq!(harness.ledger.len(), 4);
    assert_eq!(harness.store.ddl_log().len(), 2);
}

#[tokio::test]
async fn test_down_skips_irreversible_migrations() {
    let harness = Harness::new().with_users(10);
    let runner = MigrationRunner::new(harness.helpers.clone(), MigrationContext::new("production"));
    runner.run(&migrations(), MigrationDirection::Up).await.unwrap();

    let reports = runner.run(&migrations(), MigrationDirection::Down).await.unwrap();

    let names: Vec<&str> = reports.iter().map(|report| report.name.as_str()).collect();
    assert_eq!(names, vec!["QueueBackfillUserState", "AddStateChangedAt"]);
    assert_eq!(reports[0].state, MigrationState::Skipped);
    assert_eq!(reports[1].state, MigrationState::Applied);
    assert!(harness.store.ddl_log().last().unwrap().contains("DROP COLUMN"));
}

#[tokio::test]
async fn test_failing_migration_stops_the_run() {
    let harness = Harness::new().with_users(10);
    let runner = MigrationRunner::new(harness.helpers.clone(), MigrationContext::new("production"));
    let migrations: Vec<Box<dyn PostMigration>> = vec![Box::new(BrokenMigration), Box::new(AddStateChangedAt)];

    let err = runner.run(&migrations, MigrationDirection::Up).await.unwrap_err();

    assert!(matches!(err, MigrationError::MissingBatchColumn { .. }));
    // The earlier migration ran before the failure.
    assert_eq!(harness.store.ddl_log().len(), 1);
}

#[tokio::test]
async fn test_foreign_key_added_not_valid_then_validated() {
    let harness = Harness::new().with_users(3);
    harness.store.create_table(
        "projects",
        &[
            ("id", batched_migrations::models::ColumnKind::Integer),
            ("owner_id", batched_migrations::models::ColumnKind::Integer),
        ],
    );
    let context = MigrationContext::new("production");
    let helpers = &harness.helpers;

    let outcome = helpers
        .add_concurrent_foreign_key(&context, "projects", "users", "owner_id", ForeignKeyOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, DdlOutcome::Applied);
    assert_eq!(
        harness.store.foreign_key_validated("projects", "fk_projects_owner_id"),
        Some(true)
    );

    let log = harness.store.ddl_log();
    assert!(log[0].ends_with("NOT VALID"));
    assert!(log[1].contains("VALIDATE CONSTRAINT"));

    let again = helpers
        .add_concurrent_foreign_key(&context, "projects", "users", "owner_id", ForeignKeyOptions::default())
        .await
        .unwrap();
    assert_eq!(again, DdlOutcome::AlreadyApplied);
}

#[tokio::test]
async fn test_index_helpers_are_idempotent() {
    let harness = Harness::new().with_users(3);
    let context = MigrationContext::new("production");
    let helpers = &harness.helpers;

    let first = helpers
        .add_concurrent_index(&context, "users", &["state"], IndexOptions::default())
        .await
        .unwrap();
    let second = helpers
        .add_concurrent_index(&context, "users", &["state"], IndexOptions::default())
        .await
        .unwrap();
    assert_eq!((first, second), (DdlOutcome::Applied, DdlOutcome::AlreadyApplied));

    let removed = helpers
        .remove_concurrent_index(&context, "users", &["state"])
        .await
        .unwrap();
    assert_eq!(removed, DdlOutcome::Applied);
    let absent = helpers
        .remove_concurrent_index_by_name(&context, "users", "index_users_on_state")
        .await
        .unwrap();
    assert_eq!(absent, DdlOutcome::AlreadyApplied);

    let in_transaction = context.with_transaction_open(true);
    let err = helpers
        .add_concurrent_index(&in_transaction, "users", &["id"], IndexOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::TransactionOpen { .. }));
}
