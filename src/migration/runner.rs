use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{PostMigration, Reversibility};
use crate::error::Result;
use crate::guards::{GuardDecision, MigrationContext};
use crate::logging::{log_error, log_guard_decision};
use crate::orchestration::BackgroundMigrationHelpers;
use crate::state_machine::{MigrationDirection, MigrationEvent, MigrationState, MigrationStateMachine};

/// Result of running one migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub version: i64,
    pub name: String,
    pub direction: MigrationDirection,
    pub state: MigrationState,
    /// Why the migration was skipped, if it was
    pub skip_reason: Option<String>,
}

/// Runs migrations one at a time, in version order, against one set of helpers
#[derive(Debug)]
pub struct MigrationRunner {
    helpers: BackgroundMigrationHelpers,
    context: MigrationContext,
}

impl MigrationRunner {
    pub fn new(helpers: BackgroundMigrationHelpers, context: MigrationContext) -> Self {
        Self { helpers, context }
    }

    pub fn helpers(&self) -> &BackgroundMigrationHelpers {
        &self.helpers
    }

    pub fn context(&self) -> &MigrationContext {
        &self.context
    }

    /// Ascending version order for `Up`, descending for `Down`.
    ///
    /// Stops at the first failing migration and returns its error.
    pub async fn run(
        &self,
        migrations: &[Box<dyn PostMigration>],
        direction: MigrationDirection,
    ) -> Result<Vec<MigrationReport>> {
        let mut ordered: Vec<&dyn PostMigration> = migrations.iter().map(|m| m.as_ref()).collect();
        ordered.sort_by_key(|migration| migration.version());
        if direction == MigrationDirection::Down {
            ordered.reverse();
        }

        let mut reports = Vec::with_capacity(ordered.len());
        for migration in ordered {
            reports.push(self.run_one(migration, direction).await?);
        }
        Ok(reports)
    }

    #[instrument(skip(self, migration), fields(version = migration.version(), name = migration.name()))]
    pub async fn run_one(
        &self,
        migration: &dyn PostMigration,
        direction: MigrationDirection,
    ) -> Result<MigrationReport> {
        let mut machine = MigrationStateMachine::new(migration.version(), migration.name(), direction);
        let context = self.context.clone().with_caller_id(migration.name());

        let guards = migration.guards(&self.helpers);
        let decision = guards.evaluate(&context, self.helpers.schema()).await?;

        let skip_reason = match (&decision, direction, migration.reversibility()) {
            (GuardDecision::Skip { reason }, _, _) => {
                log_guard_decision(migration.name(), migration.version(), false, Some(reason));
                Some(reason.clone())
            }
            (GuardDecision::Run, MigrationDirection::Down, Reversibility::Irreversible { reason }) => {
                warn!(%reason, "Migration is irreversible, down is a no-op");
                Some(format!("irreversible: {reason}"))
            }
            (GuardDecision::Run, _, _) => {
                log_guard_decision(migration.name(), migration.version(), true, None);
                None
            }
        };

        if let Some(reason) = skip_reason {
            machine.transition(MigrationEvent::Skip(reason.clone()))?;
            return Ok(Self::report(&machine, Some(reason)));
        }

        machine.transition(MigrationEvent::Start)?;
        let outcome = match direction {
            MigrationDirection::Up => migration.up(&self.helpers, &context).await,
            MigrationDirection::Down => migration.down(&self.helpers, &context).await,
        };

        match outcome {
            Ok(()) => {
                machine.transition(MigrationEvent::Complete)?;
                info!(state = %machine.current_state(), "Migration applied");
                Ok(Self::report(&machine, None))
            }
            Err(error) => {
                machine.transition(MigrationEvent::Fail(error.to_string()))?;
                log_error(
                    "MigrationRunner",
                    migration.name(),
                    &error.to_string(),
                    Some(&format!("version {}", migration.version())),
                );
                Err(error)
            }
        }
    }

    fn report(machine: &MigrationStateMachine, skip_reason: Option<String>) -> MigrationReport {
        MigrationReport {
            version: machine.version(),
            name: machine.name().to_string(),
            direction: machine.direction(),
            state: machine.current_state(),
            skip_reason,
        }
    }
}
