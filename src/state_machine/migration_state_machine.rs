use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    errors::{invalid_transition, StateTransitionResult},
    events::MigrationEvent,
    states::MigrationState,
};

/// Direction a migration file is run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTransition {
    pub from: MigrationState,
    pub to: MigrationState,
    pub event: MigrationEvent,
    pub at: DateTime<Utc>,
}

/// Per-run state machine for one migration file.
///
/// `NotRun -> Skipped` when a guard declines, otherwise
/// `NotRun -> Applying -> Applied | Failed`. A `down` run uses the same
/// machine with [`MigrationDirection::Down`].
#[derive(Debug, Clone)]
pub struct MigrationStateMachine {
    version: i64,
    name: String,
    direction: MigrationDirection,
    state: MigrationState,
    history: Vec<MigrationTransition>,
}

impl MigrationStateMachine {
    pub fn new(version: i64, name: impl Into<String>, direction: MigrationDirection) -> Self {
        Self {
            version,
            name: name.into(),
            direction,
            state: MigrationState::NotRun,
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> MigrationState {
        self.state
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> MigrationDirection {
        self.direction
    }

    pub fn history(&self) -> &[MigrationTransition] {
        &self.history
    }

    pub fn transition(&mut self, event: MigrationEvent) -> StateTransitionResult<MigrationState> {
        let target = Self::determine_target_state(self.state, &event)?;
        self.history.push(MigrationTransition {
            from: self.state,
            to: target,
            event,
            at: Utc::now(),
        });
        self.state = target;
        Ok(target)
    }

    fn determine_target_state(
        current: MigrationState,
        event: &MigrationEvent,
    ) -> StateTransitionResult<MigrationState> {
        let target = match (current, event) {
            (MigrationState::NotRun, MigrationEvent::Skip(_)) => MigrationState::Skipped,
            (MigrationState::NotRun, MigrationEvent::Start) => MigrationState::Applying,
            (MigrationState::Applying, MigrationEvent::Complete) => MigrationState::Applied,
            (MigrationState::Applying, MigrationEvent::Fail(_)) => MigrationState::Failed,
            (from, event) => return Err(invalid_transition(from, event.event_type())),
        };
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_skip_is_terminal() {
        let mut machine = MigrationStateMachine::new(20240101000000, "BackfillThing", MigrationDirection::Up);
        assert_eq!(
            machine.transition(MigrationEvent::Skip("environment".into())).unwrap(),
            MigrationState::Skipped
        );
        assert!(machine.current_state().is_terminal());
        assert!(machine.transition(MigrationEvent::Start).is_err());
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_apply_path() {
        let mut machine = MigrationStateMachine::new(1, "AddIndex", MigrationDirection::Down);
        machine.transition(MigrationEvent::Start).unwrap();
        assert!(machine.transition(MigrationEvent::Skip("late".into())).is_err());
        machine.transition(MigrationEvent::Complete).unwrap();
        assert_eq!(machine.current_state(), MigrationState::Applied);
        assert_eq!(machine.direction(), MigrationDirection::Down);
    }
}
