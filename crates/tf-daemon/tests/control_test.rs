use chrono::{Duration, Utc};
use tf_core::config::RetryConfig;
use tf_core::graph::{CriterionInput, GraphBuilder, TaskInput, TaskListInput};
use tf_core::memory_store::MemoryStore;
use tf_core::store::TaskGraphStore;
use tf_core::types::*;
use tf_daemon::control::{self, ControlError};
use uuid::Uuid;

async fn seeded(keys: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    let tasks = keys
        .iter()
        .map(|k| {
            let mut t = TaskInput::new(*k, format!("task {k}"));
            t.pass_criteria = vec![CriterionInput::Text("done".into())];
            t
        })
        .collect();
    let graph = GraphBuilder::from_input(TaskListInput {
        name: "control".into(),
        tasks,
    })
    .unwrap();
    store
        .insert_graph(&graph.tasks, &graph.relationships)
        .await
        .unwrap();
    store
}

async fn move_to(store: &MemoryStore, key: &str, path: &[TaskStatus]) -> Task {
    let mut task = store.get_task_by_display_id(key).await.unwrap().unwrap();
    for status in path {
        task.set_status(*status);
        store.update_task(&task).await.unwrap();
    }
    task
}

#[tokio::test]
async fn find_task_accepts_display_id_or_uuid() {
    let store = seeded(&["T1", "T2"]).await;
    let t2 = control::find_task(&store, "T2").await.unwrap();
    assert_eq!(t2.display_id, "T2");
    let again = control::find_task(&store, &t2.id.to_string()).await.unwrap();
    assert_eq!(again.id, t2.id);

    let err = control::find_task(&store, "T9").await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound(ref key) if key == "T9"));
    let err = control::find_task(&store, &Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn history_collects_sessions_attempts_and_runs_in_order() {
    let store = seeded(&["T1"]).await;
    let task = store.get_task_by_display_id("T1").await.unwrap().unwrap();
    let now = Utc::now();

    let mut later = AgentSession::new(task.id, "mock");
    later.started_at = now;
    later.status = SessionStatus::Completed;
    let mut earlier = AgentSession::new(task.id, "mock");
    earlier.started_at = now - Duration::seconds(30);
    earlier.status = SessionStatus::Failed;
    store.upsert_session(&later).await.unwrap();
    store.upsert_session(&earlier).await.unwrap();

    store
        .append_retry_attempt(&RetryAttempt {
            id: Uuid::new_v4(),
            task_id: task.id,
            session_id: Some(earlier.id),
            attempt: 1,
            error_kind: ErrorKind::TransientInfra,
            decision: RetryDecision::Retry,
            backoff_ms: 1000,
            feedback: None,
            reason: "transient_infra: connection reset; retry".into(),
            created_at: now - Duration::seconds(20),
        })
        .await
        .unwrap();
    store
        .append_validation_run(&ValidationRun {
            id: Uuid::new_v4(),
            task_id: task.id,
            session_id: Some(later.id),
            level: ValidationLevel::Standard,
            checks: Vec::new(),
            passed: true,
            started_at: now,
            finished_at: now,
        })
        .await
        .unwrap();

    let history = control::task_history(&store, task.id).await.unwrap();
    assert_eq!(history.task.retry_count, 1);
    assert_eq!(
        history.sessions.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![earlier.id, later.id]
    );
    assert_eq!(history.retry_attempts.len(), 1);
    assert_eq!(history.validation_runs.len(), 1);
    assert!(history.validation_runs[0].passed);

    let json = serde_json::to_value(&history).unwrap();
    assert_eq!(json["task"]["display_id"], "T1");
}

#[tokio::test]
async fn resume_moves_blocked_task_back_to_pending() {
    let store = seeded(&["T1"]).await;
    let blocked = move_to(&store, "T1", &[TaskStatus::InProgress, TaskStatus::Blocked]).await;

    let resumed = control::resume_task(&store, &RetryConfig::default(), blocked.id)
        .await
        .unwrap();
    assert_eq!(resumed.status, TaskStatus::Pending);
    let stored = store.get_task(blocked.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
}

#[tokio::test]
async fn resume_respects_policy_and_status() {
    let store = seeded(&["T1", "T2"]).await;
    let blocked = move_to(&store, "T1", &[TaskStatus::InProgress, TaskStatus::Blocked]).await;
    let pending = store.get_task_by_display_id("T2").await.unwrap().unwrap();

    let disabled = RetryConfig {
        allow_manual_resume: false,
        ..RetryConfig::default()
    };
    let err = control::resume_task(&store, &disabled, blocked.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ResumeDisabled));

    let err = control::resume_task(&store, &RetryConfig::default(), pending.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::NotResumable { status: TaskStatus::Pending, .. }
    ));
}

#[tokio::test]
async fn cancel_skips_idle_tasks_with_a_reason() {
    let store = seeded(&["T1", "T2"]).await;
    let pending = store.get_task_by_display_id("T1").await.unwrap().unwrap();

    let skipped = control::cancel_task(&store, pending.id).await.unwrap();
    assert_eq!(skipped.status, TaskStatus::Skipped);
    assert_eq!(skipped.last_error.as_deref(), Some("cancelled"));

    let mut blocked = move_to(&store, "T2", &[TaskStatus::InProgress]).await;
    blocked.last_error = Some("validation_failure: 1 of 1 checks failed".into());
    blocked.set_status(TaskStatus::Blocked);
    store.update_task(&blocked).await.unwrap();

    let skipped = control::cancel_task(&store, blocked.id).await.unwrap();
    assert_eq!(skipped.status, TaskStatus::Skipped);
    assert_eq!(
        skipped.last_error.as_deref(),
        Some("cancelled (last error: validation_failure: 1 of 1 checks failed)")
    );
}

#[tokio::test]
async fn cancel_refuses_running_and_terminal_tasks() {
    let store = seeded(&["RUN", "DONE"]).await;
    let running = move_to(&store, "RUN", &[TaskStatus::InProgress]).await;
    let done = move_to(&store, "DONE", &[TaskStatus::InProgress, TaskStatus::Completed]).await;

    let err = control::cancel_task(&store, running.id).await.unwrap_err();
    assert!(matches!(err, ControlError::Running(ref id) if id == "RUN"));

    let err = control::cancel_task(&store, done.id).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::AlreadyTerminal { status: TaskStatus::Completed, .. }
    ));
    assert_eq!(err.to_string(), "task DONE is already completed");
}
