//! # Migration Guards
//!
//! Preconditions that decide whether a migration should run at all.
//!
//! Guards read only the injected [`MigrationContext`] and the schema through
//! [`SchemaInspector`], so they can be evaluated any number of times. A guard
//! returning `false` turns the migration into a successful no-op.

pub mod builtin;
pub mod context;

use async_trait::async_trait;
use thiserror::Error;

use crate::database::SchemaInspector;

pub use builtin::{
    AlreadyScheduledGuard, DeploymentGuard, EnvironmentGuard, FeatureFlagGuard, SchemaCondition, SchemaGuard,
};
pub use context::MigrationContext;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("Guard '{guard}' could not inspect the schema: {message}")]
    Inspection { guard: String, message: String },

    #[error("Guard '{guard}' could not read the tracking ledger: {message}")]
    Ledger { guard: String, message: String },
}

pub type GuardResult<T> = Result<T, GuardError>;

#[async_trait]
pub trait MigrationGuard: Send + Sync {
    /// Whether the migration should run
    async fn check(&self, context: &MigrationContext, schema: &dyn SchemaInspector) -> GuardResult<bool>;

    /// Description of this guard for logging and skip reasons
    fn description(&self) -> String;
}

/// Outcome of evaluating every guard of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Run,
    Skip { reason: String },
}

impl GuardDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, Self::Run)
    }
}

/// Guards of one migration, all of which must pass
#[derive(Default)]
pub struct GuardSet {
    guards: Vec<Box<dyn MigrationGuard>>,
}

impl GuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, guard: impl MigrationGuard + 'static) -> Self {
        self.guards.push(Box::new(guard));
        self
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Evaluate in order, stopping at the first guard that declines
    pub async fn evaluate(
        &self,
        context: &MigrationContext,
        schema: &dyn SchemaInspector,
    ) -> GuardResult<GuardDecision> {
        for guard in &self.guards {
            if !guard.check(context, schema).await? {
                return Ok(GuardDecision::Skip {
                    reason: guard.description(),
                });
            }
        }
        Ok(GuardDecision::Run)
    }
}

impl std::fmt::Debug for GuardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.guards.iter().map(|guard| guard.description()))
            .finish()
    }
}
