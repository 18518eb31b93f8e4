use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of one job inside the supervisor.
///
/// A job waiting out its restart backoff is `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Stopped,
    Starting,
    Running,
    /// Explicit stop in progress
    Stopping,
    /// Process ended on its own; exit is being recorded
    Exiting,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(JobState, JobState),
}

#[derive(Debug)]
pub struct StateMachine {
    pub state: JobState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: JobState::Stopped,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: JobState) -> bool {
        matches!(
            (self.state, to),
            (JobState::Stopped, JobState::Starting)
                | (JobState::Starting, JobState::Running)
                | (JobState::Starting, JobState::Stopped)
                | (JobState::Running, JobState::Stopping)
                | (JobState::Running, JobState::Exiting)
                | (JobState::Stopping, JobState::Stopped)
                | (JobState::Exiting, JobState::Stopped)
        )
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
