// State machines for tracked batch jobs and for migration runs.
//
// Job transitions are evaluated by the ledger while it holds the row; the
// migration machine is owned by the runner for the duration of one file.

pub mod errors;
pub mod events;
pub mod job_state_machine;
pub mod migration_state_machine;
pub mod states;

pub use errors::{StateTransitionError, StateTransitionResult};
pub use events::{JobEvent, MigrationEvent};
pub use job_state_machine::JobStateMachine;
pub use migration_state_machine::{MigrationDirection, MigrationStateMachine, MigrationTransition};
pub use states::{JobStatus, MigrationState};
