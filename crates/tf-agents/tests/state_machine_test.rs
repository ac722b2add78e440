use tf_agents::state_machine::{SessionEvent, SessionStateMachine, StateMachineError};
use tf_core::types::SessionStatus;

#[test]
fn first_heartbeat_moves_starting_to_running() {
    let mut sm = SessionStateMachine::new();
    assert_eq!(sm.state(), SessionStatus::Starting);

    let s = sm.transition(SessionEvent::Heartbeat).unwrap();
    assert_eq!(s, SessionStatus::Running);

    // Further heartbeats keep it running and are not recorded.
    sm.transition(SessionEvent::Heartbeat).unwrap();
    sm.transition(SessionEvent::Heartbeat).unwrap();
    assert_eq!(sm.history().len(), 1);
}

#[test]
fn exit_maps_to_completed_or_failed() {
    let mut ok = SessionStateMachine::new();
    ok.transition(SessionEvent::Heartbeat).unwrap();
    assert_eq!(
        ok.transition(SessionEvent::Exited { success: true }).unwrap(),
        SessionStatus::Completed
    );
    assert!(ok.is_terminal());

    // A worker may exit before its first heartbeat.
    let mut err = SessionStateMachine::new();
    assert_eq!(
        err.transition(SessionEvent::Exited { success: false }).unwrap(),
        SessionStatus::Failed
    );
}

#[test]
fn timeouts_and_kills() {
    let mut lost = SessionStateMachine::new();
    assert_eq!(
        lost.transition(SessionEvent::HeartbeatLost).unwrap(),
        SessionStatus::TimedOut
    );

    let mut budget = SessionStateMachine::new();
    budget.transition(SessionEvent::Heartbeat).unwrap();
    assert_eq!(
        budget.transition(SessionEvent::BudgetExceeded).unwrap(),
        SessionStatus::Killed
    );

    let mut cancelled = SessionStateMachine::default();
    assert_eq!(
        cancelled.transition(SessionEvent::Cancelled).unwrap(),
        SessionStatus::Killed
    );
}

#[test]
fn terminal_states_reject_every_event() {
    let mut sm = SessionStateMachine::new();
    sm.transition(SessionEvent::Exited { success: true }).unwrap();

    for event in [
        SessionEvent::Heartbeat,
        SessionEvent::Exited { success: false },
        SessionEvent::HeartbeatLost,
        SessionEvent::BudgetExceeded,
        SessionEvent::Cancelled,
    ] {
        let err = sm.transition(event).unwrap_err();
        assert_eq!(
            err,
            StateMachineError::InvalidTransition {
                state: SessionStatus::Completed,
                event
            }
        );
    }
    // State unchanged after rejected transitions.
    assert_eq!(sm.state(), SessionStatus::Completed);
    assert_eq!(sm.history().len(), 1);
}

#[test]
fn history_records_each_transition() {
    let mut sm = SessionStateMachine::new();
    sm.transition(SessionEvent::Heartbeat).unwrap();
    sm.transition(SessionEvent::HeartbeatLost).unwrap();

    assert_eq!(
        sm.history(),
        &[
            (
                SessionStatus::Starting,
                SessionEvent::Heartbeat,
                SessionStatus::Running
            ),
            (
                SessionStatus::Running,
                SessionEvent::HeartbeatLost,
                SessionStatus::TimedOut
            ),
        ]
    );
}
