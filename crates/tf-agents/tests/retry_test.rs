use chrono::Utc;
use tf_agents::retry::{FailureSignal, RetryClassifier};
use tf_agents::supervisor::{SessionOutcome, TimeoutReason};
use tf_core::config::RetryConfig;
use tf_core::types::{
    CheckResult, ErrorKind, FailureClass, RetryAttempt, RetryDecision, Task, ValidationLevel,
    ValidationRun,
};
use uuid::Uuid;

fn classifier() -> RetryClassifier {
    RetryClassifier::new(RetryConfig::default())
}

fn task() -> Task {
    Task::new("T1", "implement parser", Uuid::new_v4())
}

fn exit(code: i32, output: &str) -> FailureSignal {
    FailureSignal::Exit {
        exit_code: Some(code),
        output: output.into(),
    }
}

fn check(name: &str, passed: bool, output: &str) -> CheckResult {
    CheckResult {
        name: name.into(),
        description: format!("run {name}"),
        level: ValidationLevel::Standard,
        passed,
        timed_out: false,
        output_excerpt: output.into(),
        duration_ms: 10,
    }
}

fn failed_validation(task: &Task) -> FailureSignal {
    FailureSignal::Validation {
        run: ValidationRun {
            id: Uuid::new_v4(),
            task_id: task.id,
            session_id: None,
            level: ValidationLevel::Standard,
            checks: vec![
                check("typecheck", true, ""),
                check("unit", false, "test parser::empty_input ... FAILED"),
            ],
            passed: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        },
    }
}

/// Feed the same failure `n` times, appending each decision to the history.
fn replay(c: &RetryClassifier, task: &Task, failure: &FailureSignal, n: usize) -> Vec<RetryAttempt> {
    let mut history = Vec::new();
    for _ in 0..n {
        let attempt = c.decide(task, None, failure, &history).unwrap();
        history.push(attempt);
    }
    history
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn classifies_by_signal() {
    let c = classifier();
    let kind = |f: &FailureSignal| c.classify(f).map(|cl| cl.kind);

    assert_eq!(
        kind(&FailureSignal::Spawn {
            message: "exec format error".into()
        }),
        Some(ErrorKind::TransientInfra)
    );
    assert_eq!(
        kind(&FailureSignal::Misconfigured {
            message: "no worker 'x'".into()
        }),
        Some(ErrorKind::StructuralError)
    );
    assert_eq!(
        kind(&FailureSignal::Timeout {
            reason: TimeoutReason::HeartbeatLost,
            output: String::new()
        }),
        Some(ErrorKind::ExecutionTimeout)
    );
    assert_eq!(kind(&failed_validation(&task())), Some(ErrorKind::ValidationFailure));
    assert_eq!(kind(&FailureSignal::Cancelled), None);
}

#[test]
fn exit_codes_and_output_patterns() {
    let c = classifier();
    let kind = |f: FailureSignal| c.classify(&f).unwrap().kind;

    assert_eq!(kind(exit(75, "")), ErrorKind::TransientInfra);
    assert_eq!(kind(exit(65, "")), ErrorKind::StructuralError);
    assert_eq!(kind(exit(77, "")), ErrorKind::StructuralError);
    assert_eq!(
        kind(exit(1, "EACCES: permission denied, open 'src/a.ts'")),
        ErrorKind::StructuralError
    );
    assert_eq!(kind(exit(1, "write failed: No space left on device")), ErrorKind::StructuralError);
    assert_eq!(kind(exit(1, "upstream returned 503")), ErrorKind::TransientInfra);
    assert_eq!(kind(exit(1, "ECONNRESET: connection reset by peer")), ErrorKind::TransientInfra);
    assert_eq!(kind(exit(1, "something odd happened")), ErrorKind::TransientInfra);
}

#[test]
fn outcome_reduction() {
    assert_eq!(
        FailureSignal::from_outcome(&SessionOutcome::Succeeded {
            output: String::new()
        }),
        None
    );
    let signal = FailureSignal::from_outcome(&SessionOutcome::TimedOut {
        reason: TimeoutReason::BudgetExceeded,
        output: "partial".into(),
    })
    .unwrap();
    assert_eq!(signal.failure_class(), FailureClass::ExecutionTimeout);
    assert_eq!(
        FailureSignal::from_outcome(&SessionOutcome::SpawnFailed {
            message: "boom".into()
        })
        .unwrap()
        .failure_class(),
        FailureClass::SpawnError
    );
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[test]
fn transient_retries_with_backoff_then_escalates() {
    let c = classifier();
    let t = task();
    let failure = exit(1, "rate limit exceeded");
    let history = replay(&c, &t, &failure, 4);

    let decisions: Vec<_> = history.iter().map(|a| a.decision).collect();
    assert_eq!(
        decisions,
        vec![
            RetryDecision::Retry,
            RetryDecision::Retry,
            RetryDecision::Retry,
            RetryDecision::Escalate
        ]
    );
    let backoffs: Vec<_> = history.iter().map(|a| a.backoff_ms).collect();
    assert_eq!(backoffs, vec![1_000, 2_000, 4_000, 0]);
    let numbers: Vec<_> = history.iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(history.iter().all(|a| a.feedback.is_none()));
}

#[test]
fn validation_failure_retries_once_with_failing_checks() {
    let c = classifier();
    let t = task();
    let failure = failed_validation(&t);
    let history = replay(&c, &t, &failure, 2);

    let first = &history[0];
    assert_eq!(first.error_kind, ErrorKind::ValidationFailure);
    assert_eq!(first.decision, RetryDecision::Retry);
    assert_eq!(first.backoff_ms, 0);
    let feedback = first.feedback.as_ref().unwrap();
    assert_eq!(feedback.failures.len(), 1);
    assert_eq!(feedback.failures[0].name, "unit");
    assert!(feedback.failures[0].output.contains("empty_input ... FAILED"));

    assert_eq!(history[1].decision, RetryDecision::Escalate);
}

#[test]
fn structural_error_aborts_immediately() {
    let c = classifier();
    let attempt = c
        .decide(&task(), None, &exit(1, "Error: Cannot find module './db'"), &[])
        .unwrap();
    assert_eq!(attempt.decision, RetryDecision::Abort);
    assert_eq!(attempt.error_kind, ErrorKind::StructuralError);
    assert!(attempt.reason.starts_with("structural_error"));
}

#[test]
fn timeout_retries_with_reduced_scope_only_when_sub_steps_exist() {
    let c = classifier();
    let timeout = FailureSignal::Timeout {
        reason: TimeoutReason::HeartbeatLost,
        output: String::new(),
    };

    let single = task();
    let attempt = c.decide(&single, None, &timeout, &[]).unwrap();
    assert_eq!(attempt.decision, RetryDecision::Escalate);

    let mut multi = task();
    multi.sub_steps = vec!["write schema".into(), "write queries".into()];
    let history = replay(&c, &multi, &timeout, 2);
    assert_eq!(history[0].decision, RetryDecision::Retry);
    let hint = history[0]
        .feedback
        .as_ref()
        .and_then(|f| f.reduced_scope_hint.clone())
        .unwrap();
    assert!(hint.contains("write schema"));
    assert_eq!(history[1].decision, RetryDecision::Escalate);
}

#[test]
fn total_cap_forces_escalation_across_kinds() {
    let c = RetryClassifier::new(RetryConfig {
        max_total_attempts: 2,
        ..RetryConfig::default()
    });
    let t = task();
    let mut history = replay(&c, &t, &exit(1, "timeout"), 1);
    history.push(c.decide(&t, None, &failed_validation(&t), &history).unwrap());
    assert!(history.iter().all(|a| a.decision == RetryDecision::Retry));

    let third = c.decide(&t, None, &exit(1, "timeout"), &history).unwrap();
    assert_eq!(third.attempt, 3);
    assert_eq!(third.decision, RetryDecision::Escalate);
    assert!(third.reason.contains("total attempts"));
}

#[test]
fn decisions_are_reconstructable_from_history() {
    let c = classifier();
    let t = task();
    let failure = exit(1, "connection refused");
    let history = replay(&c, &t, &failure, 3);

    // Recomputing any attempt from its prefix yields the same decision.
    for (i, recorded) in history.iter().enumerate() {
        let again = c.decide(&t, None, &failure, &history[..i]).unwrap();
        assert_eq!(again.attempt, recorded.attempt);
        assert_eq!(again.decision, recorded.decision);
        assert_eq!(again.backoff_ms, recorded.backoff_ms);
        assert_eq!(again.reason, recorded.reason);
    }
}
