//! # Post-Deployment Migrations
//!
//! The framework-facing side: a [`PostMigration`] declares its guards and its
//! `up`/`down` bodies, and [`MigrationRunner`] drives each one through the
//! `NotRun -> Skipped | Applying -> Applied` state machine.

pub mod runner;

use async_trait::async_trait;

use crate::error::Result;
use crate::guards::{GuardSet, MigrationContext};
use crate::orchestration::BackgroundMigrationHelpers;

pub use runner::{MigrationReport, MigrationRunner};

/// Whether `down` undoes `up`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reversibility {
    #[default]
    Reversible,
    /// `down` is a no-op; `reason` says why the forward change can not be undone
    Irreversible { reason: String },
}

impl Reversibility {
    pub fn irreversible(reason: impl Into<String>) -> Self {
        Self::Irreversible { reason: reason.into() }
    }
}

#[async_trait]
pub trait PostMigration: Send + Sync {
    /// Timestamp version, used for ordering
    fn version(&self) -> i64;

    fn name(&self) -> &str;

    /// Preconditions evaluated before `up` or `down`
    fn guards(&self, _helpers: &BackgroundMigrationHelpers) -> GuardSet {
        GuardSet::new()
    }

    fn reversibility(&self) -> Reversibility {
        Reversibility::Reversible
    }

    async fn up(&self, helpers: &BackgroundMigrationHelpers, context: &MigrationContext) -> Result<()>;

    async fn down(&self, _helpers: &BackgroundMigrationHelpers, _context: &MigrationContext) -> Result<()> {
        Ok(())
    }
}
