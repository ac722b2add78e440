use std::time::Duration;

use tf_agents::executor::{ProcessWorker, Worker, WorkerError, WorkerInvocation};
use tf_agents::heartbeat;
use tf_core::types::Task;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn sh(script: &str) -> ProcessWorker {
    ProcessWorker::new("sh", "sh").with_args(vec!["-c".into(), script.into()])
}

fn invocation() -> WorkerInvocation {
    let task = Task::new("T1", "write a.ts", Uuid::new_v4());
    WorkerInvocation::for_task(&task, Uuid::new_v4(), 1, None)
}

#[tokio::test]
async fn heartbeats_are_split_from_output() {
    let worker = sh("echo ::heartbeat::; echo working; echo oops >&2; echo ::heartbeat::; exit 0");
    let (tx, rx) = heartbeat::channel();

    let out = worker
        .execute(invocation(), tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.exit_code, 0);
    assert!(out.output.contains("working"));
    assert!(out.output.contains("oops"));
    assert!(!out.output.contains("::heartbeat::"));
    assert_eq!(rx.len(), 2);
}

#[tokio::test]
async fn invocation_and_env_reach_the_process() {
    let worker = sh("cat; echo; echo task=$TF_TASK_ID");
    let inv = invocation();
    let task_id = inv.task_id;
    let (tx, _rx) = heartbeat::channel();

    let out = worker.execute(inv, tx, CancellationToken::new()).await.unwrap();

    assert!(out.output.contains("\"display_id\":\"T1\""));
    assert!(out.output.contains(&format!("task={task_id}")));
}

#[tokio::test]
async fn non_zero_exit_is_reported_not_an_error() {
    let worker = sh("echo 'no such file: spec.md' >&2; exit 3");
    let (tx, _rx) = heartbeat::channel();

    let out = worker
        .execute(invocation(), tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.exit_code, 3);
    assert!(out.output.contains("no such file"));
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let worker = ProcessWorker::new("ghost", "/nonexistent/taskforge-worker");
    let (tx, _rx) = heartbeat::channel();

    let err = worker
        .execute(invocation(), tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Spawn(_)));
}

#[tokio::test]
async fn cancellation_kills_the_child() {
    let worker = sh("echo started; sleep 30");
    let (tx, _rx) = heartbeat::channel();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = worker.execute(invocation(), tx, cancel).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    match err {
        WorkerError::Cancelled { partial_output } => assert!(partial_output.contains("started")),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn output_is_tail_truncated() {
    let worker = sh("for i in $(seq 1 200); do echo line-$i; done").with_capture_bytes(64);
    let (tx, _rx) = heartbeat::channel();

    let out = worker
        .execute(invocation(), tx, CancellationToken::new())
        .await
        .unwrap();

    assert!(out.output.starts_with("[...truncated...]"));
    assert!(out.output.contains("line-200"));
    assert!(!out.output.contains("line-1\n"));
}
