//! Retry & escalation classifier.
//!
//! Pure and deterministic: the decision for a failure depends only on the
//! task, the failure signal and the task's existing retry history, so any
//! decision can be recomputed from the stored log.

use std::time::Duration;

use chrono::Utc;
use tf_core::config::RetryConfig;
use tf_core::types::{
    ErrorKind, FailureClass, FailureDetail, RetryAttempt, RetryDecision, RetryFeedback, Task,
    ValidationRun,
};
use uuid::Uuid;

use crate::supervisor::{SessionOutcome, TimeoutReason};

// sysexits(3)
const EX_DATAERR: i32 = 65;
const EX_NOINPUT: i32 = 66;
const EX_CANTCREAT: i32 = 73;
const EX_TEMPFAIL: i32 = 75;
const EX_NOPERM: i32 = 77;
const EX_CONFIG: i32 = 78;

const STRUCTURAL_PATTERNS: &[&str] = &[
    "no such file",
    "permission denied",
    "no space left",
    "disk full",
    "malformed",
    "cannot find module",
    "not found in specification",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "rate limit",
    "429",
    "503",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "out of memory",
];

/// A failed attempt, reduced to what the classifier needs.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureSignal {
    /// The worker could not be started.
    Spawn { message: String },
    /// The task names a worker that does not exist.
    Misconfigured { message: String },
    /// The worker ran and exited non-zero.
    Exit {
        exit_code: Option<i32>,
        output: String,
    },
    Timeout {
        reason: TimeoutReason,
        output: String,
    },
    Validation { run: ValidationRun },
    /// Externally cancelled; never classified.
    Cancelled,
}

impl FailureSignal {
    /// Reduce a terminal session outcome. `None` for success.
    pub fn from_outcome(outcome: &SessionOutcome) -> Option<Self> {
        match outcome {
            SessionOutcome::Succeeded { .. } => None,
            SessionOutcome::Failed { exit_code, output } => Some(FailureSignal::Exit {
                exit_code: *exit_code,
                output: output.clone(),
            }),
            SessionOutcome::SpawnFailed { message } => Some(FailureSignal::Spawn {
                message: message.clone(),
            }),
            SessionOutcome::TimedOut { reason, output } => Some(FailureSignal::Timeout {
                reason: *reason,
                output: output.clone(),
            }),
            SessionOutcome::Cancelled => Some(FailureSignal::Cancelled),
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            FailureSignal::Spawn { .. } | FailureSignal::Misconfigured { .. } => {
                FailureClass::SpawnError
            }
            FailureSignal::Exit { .. } | FailureSignal::Cancelled => FailureClass::ExecutionFailure,
            FailureSignal::Timeout { .. } => FailureClass::ExecutionTimeout,
            FailureSignal::Validation { .. } => FailureClass::ValidationFailure,
        }
    }

    /// First meaningful line of the failure, for logs and pattern memory.
    pub fn signature(&self) -> String {
        let text = match self {
            FailureSignal::Spawn { message } | FailureSignal::Misconfigured { message } => {
                message.as_str()
            }
            FailureSignal::Exit { output, .. } | FailureSignal::Timeout { output, .. } => {
                output.as_str()
            }
            FailureSignal::Validation { run } => {
                return run
                    .failing_checks()
                    .map(|c| c.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
            }
            FailureSignal::Cancelled => return "cancelled".into(),
        };
        signature_line(text)
    }
}

fn signature_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("[...truncated"))
        .unwrap_or("");
    line.chars().take(200).collect()
}

/// Kind plus a short human-readable cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub cause: String,
}

pub struct RetryClassifier {
    config: RetryConfig,
}

impl RetryClassifier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Map a failure to an error kind. `None` for cancellations.
    pub fn classify(&self, failure: &FailureSignal) -> Option<Classification> {
        let (kind, cause) = match failure {
            FailureSignal::Cancelled => return None,
            FailureSignal::Spawn { message } => {
                (ErrorKind::TransientInfra, format!("spawn error: {message}"))
            }
            FailureSignal::Misconfigured { message } => {
                (ErrorKind::StructuralError, format!("misconfigured: {message}"))
            }
            FailureSignal::Timeout { reason, .. } => (
                ErrorKind::ExecutionTimeout,
                match reason {
                    TimeoutReason::HeartbeatLost => "heartbeat lost".to_string(),
                    TimeoutReason::BudgetExceeded => "execution budget exceeded".to_string(),
                },
            ),
            FailureSignal::Validation { run } => {
                let failing = run.failing_checks().count();
                (
                    ErrorKind::ValidationFailure,
                    format!(
                        "{failing} of {} checks failed at level {}",
                        run.checks.len(),
                        run.level
                    ),
                )
            }
            FailureSignal::Exit { exit_code, output } => classify_exit(*exit_code, output),
        };
        Some(Classification { kind, cause })
    }

    /// Cap on attempts of one kind before escalation.
    pub fn kind_cap(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::TransientInfra => self.config.transient_max_attempts,
            ErrorKind::ValidationFailure => self.config.validation_max_attempts,
            ErrorKind::ExecutionTimeout => self.config.timeout_max_attempts,
            ErrorKind::StructuralError => 0,
        }
    }

    /// Exponential backoff for the `n`th transient attempt (1-based).
    pub fn backoff(&self, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(32);
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Produce the next RetryAttempt for `task`. Returns `None` when the
    /// failure is a cancellation.
    pub fn decide(
        &self,
        task: &Task,
        session_id: Option<Uuid>,
        failure: &FailureSignal,
        history: &[RetryAttempt],
    ) -> Option<RetryAttempt> {
        let Classification { kind, cause } = self.classify(failure)?;
        let attempt = history.len() as u32 + 1;
        let kind_attempt = history.iter().filter(|a| a.error_kind == kind).count() as u32 + 1;
        let cap = self.kind_cap(kind);

        let (decision, why) = if kind == ErrorKind::StructuralError {
            (RetryDecision::Abort, "structural error cannot be retried".to_string())
        } else if attempt > self.config.max_total_attempts {
            (
                RetryDecision::Escalate,
                format!("total attempts {attempt} exceed cap {}", self.config.max_total_attempts),
            )
        } else if kind_attempt > cap {
            (
                RetryDecision::Escalate,
                format!("{kind} attempt {kind_attempt} exceeds cap {cap}"),
            )
        } else if kind == ErrorKind::ExecutionTimeout && task.sub_steps.len() < 2 {
            (
                RetryDecision::Escalate,
                "timed out and declares no sub-steps to reduce scope".to_string(),
            )
        } else {
            (RetryDecision::Retry, format!("{kind} attempt {kind_attempt} of {cap}"))
        };

        let backoff_ms = match (decision, kind) {
            (RetryDecision::Retry, ErrorKind::TransientInfra) => {
                self.backoff(kind_attempt).as_millis() as u64
            }
            _ => 0,
        };

        Some(RetryAttempt {
            id: Uuid::new_v4(),
            task_id: task.id,
            session_id,
            attempt,
            error_kind: kind,
            decision,
            backoff_ms,
            feedback: feedback_for(task, failure, kind, &cause),
            reason: format!("{kind}: {cause}; {decision} ({why})"),
            created_at: Utc::now(),
        })
    }
}

fn classify_exit(exit_code: Option<i32>, output: &str) -> (ErrorKind, String) {
    match exit_code {
        Some(EX_TEMPFAIL) => {
            return (ErrorKind::TransientInfra, "exit 75 (temporary failure)".into());
        }
        Some(code @ (EX_DATAERR | EX_NOINPUT | EX_CANTCREAT | EX_NOPERM | EX_CONFIG)) => {
            return (ErrorKind::StructuralError, format!("exit {code} ({})", sysexit_name(code)));
        }
        _ => {}
    }

    let code = exit_code.map_or_else(|| "unknown exit".to_string(), |c| format!("exit {c}"));
    let lowered = output.to_lowercase();
    if let Some(p) = STRUCTURAL_PATTERNS.iter().find(|p| lowered.contains(**p)) {
        return (ErrorKind::StructuralError, format!("{code}: {p}"));
    }
    if let Some(p) = TRANSIENT_PATTERNS.iter().find(|p| lowered.contains(**p)) {
        return (ErrorKind::TransientInfra, format!("{code}: {p}"));
    }
    (ErrorKind::TransientInfra, format!("{code}: unrecognised failure"))
}

fn sysexit_name(code: i32) -> &'static str {
    match code {
        EX_DATAERR => "data error",
        EX_NOINPUT => "missing input",
        EX_CANTCREAT => "cannot create output",
        EX_NOPERM => "permission denied",
        EX_CONFIG => "configuration error",
        _ => "unknown",
    }
}

fn feedback_for(
    task: &Task,
    failure: &FailureSignal,
    kind: ErrorKind,
    cause: &str,
) -> Option<RetryFeedback> {
    match (kind, failure) {
        (ErrorKind::ValidationFailure, FailureSignal::Validation { run }) => Some(RetryFeedback {
            summary: cause.to_string(),
            failures: run
                .failing_checks()
                .map(|c| FailureDetail {
                    name: c.name.clone(),
                    output: c.output_excerpt.clone(),
                })
                .collect(),
            reduced_scope_hint: None,
        }),
        (ErrorKind::ExecutionTimeout, _) => {
            let hint = task
                .sub_steps
                .first()
                .filter(|_| task.sub_steps.len() > 1)
                .map(|step| format!("Complete only the first sub-step this attempt: {step}"));
            Some(RetryFeedback {
                summary: cause.to_string(),
                failures: Vec::new(),
                reduced_scope_hint: hint,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysexits_take_precedence_over_text() {
        assert_eq!(
            classify_exit(Some(75), "permission denied").0,
            ErrorKind::TransientInfra
        );
        assert_eq!(classify_exit(Some(78), "").0, ErrorKind::StructuralError);
    }

    #[test]
    fn text_patterns_and_fallback() {
        assert_eq!(
            classify_exit(Some(1), "Error: No such file or directory").0,
            ErrorKind::StructuralError
        );
        assert_eq!(
            classify_exit(Some(1), "HTTP 429 rate limit").0,
            ErrorKind::TransientInfra
        );
        assert_eq!(classify_exit(Some(2), "boom").0, ErrorKind::TransientInfra);
        assert_eq!(classify_exit(None, "").0, ErrorKind::TransientInfra);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let c = RetryClassifier::new(RetryConfig::default());
        assert_eq!(c.backoff(1), Duration::from_millis(1_000));
        assert_eq!(c.backoff(2), Duration::from_millis(2_000));
        assert_eq!(c.backoff(3), Duration::from_millis(4_000));
        assert_eq!(c.backoff(40), Duration::from_millis(60_000));
    }

    #[test]
    fn signature_skips_blank_and_truncation_lines() {
        assert_eq!(
            signature_line("[...truncated...]\n\n  error: x failed \nmore"),
            "error: x failed"
        );
    }
}
