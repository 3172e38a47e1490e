//! Controller run state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    PausedByUser,
    PausedAtBreakpoint,
    Stopping,
    Completed,
}

impl ExecutionState {
    /// A run exists and has not finished.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ExecutionState::Running
                | ExecutionState::PausedByUser
                | ExecutionState::PausedAtBreakpoint
                | ExecutionState::Stopping
        )
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            ExecutionState::PausedByUser | ExecutionState::PausedAtBreakpoint
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Idle | Completed, Running)
                | (Running, PausedByUser | PausedAtBreakpoint | Stopping | Completed)
                | (PausedByUser | PausedAtBreakpoint, Running | Stopping)
                | (Stopping, Completed)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::PausedByUser => "paused",
            ExecutionState::PausedAtBreakpoint => "paused at breakpoint",
            ExecutionState::Stopping => "stopping",
            ExecutionState::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionState::*;

    #[test]
    fn test_pause_only_from_running() {
        assert!(Running.can_transition_to(PausedByUser));
        assert!(!Idle.can_transition_to(PausedByUser));
        assert!(!Stopping.can_transition_to(PausedAtBreakpoint));
    }

    #[test]
    fn test_stopping_only_completes() {
        assert!(Stopping.can_transition_to(Completed));
        assert!(!Stopping.can_transition_to(Running));
        assert!(PausedAtBreakpoint.can_transition_to(Stopping));
    }

    #[test]
    fn test_completed_can_start_again() {
        assert!(Completed.can_transition_to(Running));
        assert!(!Completed.is_active());
        assert!(PausedByUser.is_active() && PausedByUser.is_paused());
    }
}
