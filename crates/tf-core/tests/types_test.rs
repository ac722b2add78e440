use tf_core::types::*;
use uuid::Uuid;

#[test]
fn status_transitions_are_forward_only_except_retry_and_resume() {
    use TaskStatus::*;
    assert!(Pending.can_transition_to(&InProgress));
    assert!(InProgress.can_transition_to(&Completed));
    assert!(InProgress.can_transition_to(&Blocked));
    assert!(Failed.can_transition_to(&Pending));
    assert!(Blocked.can_transition_to(&Pending));

    assert!(!Completed.can_transition_to(&Pending));
    assert!(!Skipped.can_transition_to(&Pending));
    assert!(!Pending.can_transition_to(&Completed));
    assert!(!InProgress.can_transition_to(&Pending));
}

#[test]
fn terminal_statuses_have_no_outgoing_transitions() {
    for from in TaskStatus::ALL.iter().filter(|s| s.is_terminal()) {
        for to in TaskStatus::ALL {
            assert!(!from.can_transition_to(&to), "{from} -> {to}");
        }
    }
}

#[test]
fn conflict_matrix() {
    use FileOperation::*;
    let writes = [Create, Update, Delete];
    for a in writes {
        for b in writes {
            assert!(a.conflicts_with(&b), "{a:?} x {b:?}");
        }
        assert!(!a.conflicts_with(&Read));
        assert!(!Read.conflicts_with(&a));
    }
    assert!(!Read.conflicts_with(&Read));
}

#[test]
fn impacts_conflict_only_on_same_normalised_path() {
    let a = FileImpact::new("./src/a.ts", FileOperation::Create);
    let b = FileImpact::new("src//a.ts", FileOperation::Update);
    let c = FileImpact::new("src/b.ts", FileOperation::Create);
    assert!(a.conflicts_with(&b));
    assert!(!a.conflicts_with(&c));
}

#[test]
fn normalize_path_variants() {
    assert_eq!(normalize_path("./a/./b.rs"), "a/b.rs");
    assert_eq!(normalize_path("a\\b\\c.rs"), "a/b/c.rs");
    assert_eq!(normalize_path("/abs//x"), "/abs/x");
    assert_eq!(normalize_path("  "), "");
}

#[test]
fn validation_levels_by_priority() {
    assert_eq!(ValidationLevel::for_priority(TaskPriority::Low), ValidationLevel::Quick);
    assert_eq!(
        ValidationLevel::for_priority(TaskPriority::Medium),
        ValidationLevel::Standard
    );
    assert_eq!(
        ValidationLevel::for_priority(TaskPriority::High),
        ValidationLevel::Thorough
    );
    assert_eq!(
        ValidationLevel::for_priority(TaskPriority::Critical),
        ValidationLevel::Release
    );
    assert!(ValidationLevel::Quick < ValidationLevel::Release);
}

#[test]
fn relationship_dependency_direction() {
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let dep = TaskRelationship::new(a, b, RelationshipKind::DependsOn);
    let blk = TaskRelationship::new(a, b, RelationshipKind::Blocks);
    let rel = TaskRelationship::new(a, b, RelationshipKind::RelatedTo);
    assert_eq!(dep.as_dependency(), Some((a, b)));
    assert_eq!(blk.as_dependency(), Some((b, a)));
    assert_eq!(rel.as_dependency(), None);
    assert!(!RelationshipKind::SubtaskOf.affects_scheduling());
    assert!(RelationshipKind::ConflictsWith.affects_scheduling());
}

#[test]
fn written_paths_exclude_reads() {
    let mut task = Task::new("T1", "t", Uuid::new_v4());
    task.file_impacts = vec![
        FileImpact::new("a.rs", FileOperation::Update),
        FileImpact::new("b.rs", FileOperation::Read),
        FileImpact::new("c.rs", FileOperation::Delete),
    ];
    assert_eq!(task.written_paths(), vec!["a.rs".to_string(), "c.rs".to_string()]);
}

#[test]
fn set_status_stamps_timestamps() {
    let mut task = Task::new("T1", "t", Uuid::new_v4());
    task.set_status(TaskStatus::InProgress);
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_none());
    task.set_status(TaskStatus::Completed);
    assert!(task.completed_at.is_some());
}

#[test]
fn enums_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&TaskStatus::InProgress).unwrap(),
        "\"in_progress\""
    );
    assert_eq!(
        serde_json::to_string(&ErrorKind::TransientInfra).unwrap(),
        "\"transient_infra\""
    );
    assert_eq!(serde_json::to_string(&Effort::XLarge).unwrap(), "\"xlarge\"");
    assert_eq!(
        serde_json::to_string(&SessionStatus::TimedOut).unwrap(),
        "\"timed_out\""
    );
}

#[test]
fn check_definition_from_json() {
    let def: CheckDefinition = serde_json::from_str(
        r#"{
            "name": "unit",
            "level": "standard",
            "run": { "kind": "command", "program": "cargo", "args": ["test"] },
            "expect": { "kind": "output_contains", "text": "ok" }
        }"#,
    )
    .unwrap();
    assert_eq!(def.level, ValidationLevel::Standard);
    assert_eq!(
        def.expect,
        Expectation::OutputContains {
            text: "ok".into()
        }
    );
    assert!(def.timeout_secs.is_none());
}
