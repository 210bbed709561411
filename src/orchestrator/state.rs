//! Lifecycle of a single execution.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Lifecycle state of one unit execution.
///
/// ```text
/// Prepared -> Launched -> Running -> Succeeded | Failed
/// Prepared | Launched -> LaunchError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Prepared,
    Launched,
    Running,
    Succeeded,
    Failed,
    LaunchError,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::LaunchError
        )
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Prepared, Launched)
                | (Launched, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Prepared, LaunchError)
                | (Launched, LaunchError)
        )
    }

    /// Moves to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(&mut self, next: ExecutionState) -> Result<(), OrchestratorError> {
        if !self.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Prepared => "prepared",
            ExecutionState::Launched => "launched",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::LaunchError => "launch_error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = ExecutionState::Prepared;
        state.transition(ExecutionState::Launched).unwrap();
        state.transition(ExecutionState::Running).unwrap();
        state.transition(ExecutionState::Succeeded).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_launch_error_paths() {
        assert!(ExecutionState::Prepared.can_transition_to(ExecutionState::LaunchError));
        assert!(ExecutionState::Launched.can_transition_to(ExecutionState::LaunchError));
        assert!(!ExecutionState::Running.can_transition_to(ExecutionState::LaunchError));
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = ExecutionState::Succeeded;
        let err = state.transition(ExecutionState::Running).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition from 'succeeded' to 'running'"
        );
        assert_eq!(state, ExecutionState::Succeeded);

        let mut state = ExecutionState::Prepared;
        assert!(state.transition(ExecutionState::Succeeded).is_err());
    }
}
