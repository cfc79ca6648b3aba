use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

impl fmt::Display for SupervisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0} -> {1}")]
    InvalidTransition(SupervisionState, SupervisionState),
}

pub struct StateMachine {
    state: SupervisionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: SupervisionState::Stopped,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SupervisionState {
        self.state
    }

    pub fn is(&self, state: SupervisionState) -> bool {
        self.state == state
    }

    pub fn can_transition(&self, to: SupervisionState) -> bool {
        use SupervisionState::*;
        matches!(
            (self.state, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Restarting)
                | (Running, Stopped)
                | (Restarting, Starting)
                | (Restarting, Stopped)
        )
    }

    pub fn transition(&mut self, to: SupervisionState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("Supervision state: {} -> {}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
