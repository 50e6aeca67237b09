use agent_gateway::models::session::{ConnectionMode, Session, SessionStatus};

#[test]
fn blank_id_is_replaced_with_uuid() {
    let session = Session::new(Some("  ".into()), "process", ConnectionMode::Interactive);
    assert!(uuid::Uuid::parse_str(&session.id).is_ok());
    assert_eq!(session.status, SessionStatus::Idle);

    let named = Session::new(Some("resume-1".into()), "process", ConnectionMode::Batch);
    assert_eq!(named.id, "resume-1");
    assert_eq!(named.mode, ConnectionMode::Batch);
}

#[test]
fn happy_path_lifecycle() {
    let mut session = Session::new(None, "process", ConnectionMode::default());
    assert!(session.transition(SessionStatus::Starting));
    assert!(session.transition(SessionStatus::Running));
    assert!(session.transition(SessionStatus::Stopping));
    assert!(session.transition(SessionStatus::Terminated));
    assert_eq!(session.status, SessionStatus::Terminated);
}

#[test]
fn failed_start_goes_straight_to_stopping() {
    let mut session = Session::new(None, "process", ConnectionMode::default());
    assert!(session.transition(SessionStatus::Starting));
    assert!(session.transition(SessionStatus::Stopping));
    assert!(session.transition(SessionStatus::Terminated));
}

#[test]
fn illegal_transitions_leave_status_alone() {
    let mut session = Session::new(None, "process", ConnectionMode::default());
    assert!(!session.transition(SessionStatus::Running));
    assert!(!session.transition(SessionStatus::Terminated));
    assert_eq!(session.status, SessionStatus::Idle);

    session.transition(SessionStatus::Starting);
    session.transition(SessionStatus::Running);
    assert!(!session.can_transition_to(SessionStatus::Starting));
    assert!(!session.can_transition_to(SessionStatus::Terminated));
}

#[test]
fn status_serializes_snake_case() {
    assert_eq!(
        serde_json::to_string(&SessionStatus::Running).expect("json"),
        "\"running\""
    );
    assert_eq!(
        serde_json::from_str::<ConnectionMode>("\"interactive\"").expect("mode"),
        ConnectionMode::Interactive
    );
}
