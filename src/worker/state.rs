//! Worker lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Registering with the queue.
    Starting,
    /// Waiting for a job.
    Polling,
    /// Converting a claimed job.
    Executing,
    /// Stop requested; finishing the in-flight job.
    Stopping,
    /// Unregistered after a clean shutdown.
    Stopped,
    /// Gave up after a fatal queue error.
    Crashed,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // From Starting
            (Starting, Polling) | (Starting, Stopping) | (Starting, Crashed) |
            // From Polling
            (Polling, Executing) | (Polling, Stopping) | (Polling, Crashed) |
            // From Executing
            (Executing, Polling) | (Executing, Stopping) | (Executing, Crashed) |
            // From Stopping
            (Stopping, Stopped) | (Stopping, Crashed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether new jobs may be claimed in this state.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::Polling)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Polling => "polling",
            Self::Executing => "executing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current state plus a bounded transition history.
#[derive(Debug, Clone, Serialize)]
pub struct Lifecycle {
    state: WorkerState,
    transitions: Vec<StateTransition>,
}

/// Polling ⇄ Executing flips on every job; keep the tail only.
const MAX_TRANSITIONS: usize = 200;

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Starting,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: WorkerState,
        reason: Option<String>,
    ) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(new_state) {
            return Err(WorkerError::InvalidState {
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        Ok(())
    }

    /// Move to `Crashed` from wherever the worker is, unless already terminal.
    pub fn crash(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            let reason = reason.into();
            self.transitions.push(StateTransition {
                from: self.state,
                to: WorkerState::Crashed,
                timestamp: Utc::now(),
                reason: Some(reason),
            });
            self.state = WorkerState::Crashed;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(WorkerState::Starting.can_transition_to(WorkerState::Polling));
        assert!(WorkerState::Polling.can_transition_to(WorkerState::Executing));
        assert!(WorkerState::Executing.can_transition_to(WorkerState::Polling));
        assert!(WorkerState::Executing.can_transition_to(WorkerState::Stopping));
        assert!(WorkerState::Stopping.can_transition_to(WorkerState::Stopped));
        assert!(WorkerState::Polling.can_transition_to(WorkerState::Crashed));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Polling));
        assert!(!WorkerState::Crashed.can_transition_to(WorkerState::Starting));
        assert!(!WorkerState::Starting.can_transition_to(WorkerState::Executing));
        assert!(!WorkerState::Stopping.can_transition_to(WorkerState::Executing));
        assert!(!WorkerState::Polling.can_transition_to(WorkerState::Stopped));
    }

    #[test]
    fn terminal_states() {
        assert!(WorkerState::Stopped.is_terminal());
        assert!(WorkerState::Crashed.is_terminal());
        assert!(!WorkerState::Stopping.is_terminal());
        assert!(WorkerState::Polling.accepts_jobs());
        assert!(!WorkerState::Stopping.accepts_jobs());
    }

    #[test]
    fn lifecycle_records_transitions() {
        let mut lc = Lifecycle::new();
        lc.transition_to(WorkerState::Polling, None).unwrap();
        lc.transition_to(WorkerState::Executing, Some("job 1".into()))
            .unwrap();
        assert_eq!(lc.state(), WorkerState::Executing);
        assert_eq!(lc.transitions().len(), 2);

        let err = lc.transition_to(WorkerState::Starting, None).unwrap_err();
        assert!(err.to_string().contains("executing"));
        assert_eq!(lc.state(), WorkerState::Executing);
    }

    #[test]
    fn transition_history_capped() {
        let mut lc = Lifecycle::new();
        lc.transition_to(WorkerState::Polling, None).unwrap();
        for _ in 0..250 {
            lc.transition_to(WorkerState::Executing, None).unwrap();
            lc.transition_to(WorkerState::Polling, None).unwrap();
        }
        assert!(lc.transitions().len() <= MAX_TRANSITIONS);
    }

    #[test]
    fn crash_is_sticky() {
        let mut lc = Lifecycle::new();
        lc.crash("store gone");
        assert_eq!(lc.state(), WorkerState::Crashed);
        lc.crash("again");
        assert_eq!(lc.transitions().len(), 1);
    }

    #[test]
    fn worker_state_serde() {
        let json = serde_json::to_string(&WorkerState::Executing).unwrap();
        assert_eq!(json, "\"executing\"");
    }
}
