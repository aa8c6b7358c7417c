use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{MigrationError, Result};
use crate::models::normalize_job_class_name;

/// Executes one batch of a backfill.
///
/// Receives `static_arguments ++ [lower_bound, upper_bound]`. Implementations
/// must be idempotent and must re-apply the backfill's row predicate, since
/// the range is only a scan bound.
#[async_trait]
pub trait MigrationHandler: Send + Sync {
    async fn perform(&self, arguments: &[Value]) -> anyhow::Result<()>;
}

/// Adapts a synchronous closure into a [`MigrationHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MigrationHandler for FnHandler<F>
where
    F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync,
{
    async fn perform(&self, arguments: &[Value]) -> anyhow::Result<()> {
        (self.0)(arguments)
    }
}

/// Thread-safe map from job class name to handler
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn MigrationHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_classes", &self.job_class_names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a job class
    pub fn register(&self, job_class_name: &str, handler: Arc<dyn MigrationHandler>) {
        let name = normalize_job_class_name(job_class_name);
        debug!(job_class_name = %name, "📚 Registering migration handler");
        self.handlers.insert(name, handler);
    }

    pub fn register_fn<F>(&self, job_class_name: &str, handler: F)
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(job_class_name, Arc::new(FnHandler(handler)));
    }

    pub fn unregister(&self, job_class_name: &str) -> bool {
        self.handlers
            .remove(&normalize_job_class_name(job_class_name))
            .is_some()
    }

    pub fn resolve(&self, job_class_name: &str) -> Result<Arc<dyn MigrationHandler>> {
        let name = normalize_job_class_name(job_class_name);
        self.handlers
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(MigrationError::JobClassNotFound { job_class_name: name })
    }

    pub fn contains(&self, job_class_name: &str) -> bool {
        self.handlers.contains_key(&normalize_job_class_name(job_class_name))
    }

    pub fn job_class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}
