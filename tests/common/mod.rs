//! Shared fixtures for the in-memory integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use batched_migrations::config::{FinalizationConfig, SchedulerConfig};
use batched_migrations::database::InMemoryStore;
use batched_migrations::ledger::InMemoryLedger;
use batched_migrations::messaging::InMemoryJobQueue;
use batched_migrations::models::ColumnKind;
use batched_migrations::orchestration::BackgroundMigrationHelpers;
use batched_migrations::registry::HandlerRegistry;

pub const BACKFILL: &str = "BackfillUserState";

/// Defaults with a gate that gives up quickly
pub fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.finalization = FinalizationConfig {
        poll_interval_ms: 5,
        backoff_multiplier: 2.0,
        max_poll_interval_ms: 20,
        max_wait_seconds: 0,
        max_inline_attempts: 3,
    };
    config
}

/// Store, ledger and queue with helpers wired to all three
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub queue: Arc<InMemoryJobQueue>,
    pub registry: HandlerRegistry,
    pub helpers: BackgroundMigrationHelpers,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(InMemoryJobQueue::new(config.queue.queue_name.clone()));
        let registry = HandlerRegistry::new();
        let helpers = BackgroundMigrationHelpers::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            registry.clone(),
            config,
        );

        Self {
            store,
            ledger,
            queue,
            registry,
            helpers,
        }
    }

    /// `users(id integer, state text)` with ids `1..=rows`
    pub fn with_users(self, rows: i64) -> Self {
        self.store.create_table(
            "users",
            &[("id", ColumnKind::Integer), ("state", ColumnKind::Text)],
        );
        for id in 1..=rows {
            self.store
                .insert_row("users", json!({"id": id, "state": null}))
                .unwrap();
        }
        self
    }

    /// Register a handler that records each call's arguments
    pub fn record_calls(&self, job_class_name: &str) -> Arc<Mutex<Vec<Vec<Value>>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        self.registry.register_fn(job_class_name, move |arguments| {
            sink.lock().push(arguments.to_vec());
            Ok(())
        });
        calls
    }

    /// Register a handler that sets `users.state` for the range it receives
    pub fn register_state_backfill(&self, job_class_name: &str) {
        let store = Arc::clone(&self.store);
        self.registry.register_fn(job_class_name, move |arguments| {
            let (lower, upper) = bounds(arguments)?;
            store.update_rows(
                &batched_migrations::models::Relation::table("users"),
                |row| {
                    let id = row.get("id").and_then(Value::as_i64).unwrap_or_default();
                    if (lower..=upper).contains(&id) {
                        row.insert("state".to_string(), json!("active"));
                    }
                },
            );
            Ok(())
        });
    }
}

/// The trailing `[lower, upper]` pair of worker arguments
pub fn bounds(arguments: &[Value]) -> anyhow::Result<(i64, i64)> {
    match arguments {
        [.., lower, upper] => Ok((
            lower.as_i64().ok_or_else(|| anyhow::anyhow!("lower bound is not an integer"))?,
            upper.as_i64().ok_or_else(|| anyhow::anyhow!("upper bound is not an integer"))?,
        )),
        _ => anyhow::bail!("expected at least two arguments, got {}", arguments.len()),
    }
}
