use serde::{Deserialize, Serialize};
use std::fmt;
use tf_core::types::SessionStatus;

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Heartbeat,
    Exited { success: bool },
    HeartbeatLost,
    BudgetExceeded,
    Cancelled,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Heartbeat => f.write_str("heartbeat"),
            SessionEvent::Exited { success: true } => f.write_str("exited(ok)"),
            SessionEvent::Exited { success: false } => f.write_str("exited(err)"),
            SessionEvent::HeartbeatLost => f.write_str("heartbeat_lost"),
            SessionEvent::BudgetExceeded => f.write_str("budget_exceeded"),
            SessionEvent::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: SessionStatus,
        event: SessionEvent,
    },
}

// ---------------------------------------------------------------------------
// SessionStateMachine
// ---------------------------------------------------------------------------

/// Lifecycle of one agent session.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionStatus,
    history: Vec<(SessionStatus, SessionEvent, SessionStatus)>,
}

impl SessionStateMachine {
    /// Create a new state machine starting in `Starting`.
    pub fn new() -> Self {
        Self {
            current: SessionStatus::Starting,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionStatus {
        self.current
    }

    pub fn history(&self) -> &[(SessionStatus, SessionEvent, SessionStatus)] {
        &self.history
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Starting          + Heartbeat      -> Running
    /// - Running           + Heartbeat      -> Running (not recorded)
    /// - Starting | Running + Exited(ok)    -> Completed
    /// - Starting | Running + Exited(err)   -> Failed
    /// - Starting | Running + HeartbeatLost -> TimedOut
    /// - Starting | Running + BudgetExceeded | Cancelled -> Killed
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionStatus, StateMachineError> {
        use SessionStatus::*;
        let live = matches!(self.current, Starting | Running);
        let next = match (self.current, event) {
            (Starting, SessionEvent::Heartbeat) => Running,
            (Running, SessionEvent::Heartbeat) => return Ok(Running),
            (_, SessionEvent::Exited { success: true }) if live => Completed,
            (_, SessionEvent::Exited { success: false }) if live => Failed,
            (_, SessionEvent::HeartbeatLost) if live => TimedOut,
            (_, SessionEvent::BudgetExceeded | SessionEvent::Cancelled) if live => Killed,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "session state transition");
        Ok(next)
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
