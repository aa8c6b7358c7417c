use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Unknown state in storage: {0}")]
    UnknownState(String),
}

pub type StateTransitionResult<T> = Result<T, StateTransitionError>;

pub fn invalid_transition(from: impl ToString, event: &str) -> StateTransitionError {
    StateTransitionError::InvalidTransition {
        from: from.to_string(),
        event: event.to_string(),
    }
}
