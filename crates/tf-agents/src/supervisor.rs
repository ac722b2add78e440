use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tf_core::store::TaskGraphStore;
use tf_core::types::{AgentSession, RetryFeedback, Task};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::executor::{Worker, WorkerError, WorkerInvocation, WorkerOutput, WorkerRegistry};
use crate::heartbeat::{self, HeartbeatTracker};
use crate::lifecycle::{LifecycleError, LifecyclePolicy, Result};
use crate::state_machine::{SessionEvent, SessionStateMachine};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    HeartbeatLost,
    BudgetExceeded,
}

/// The single signal a finished session reduces to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Succeeded {
        output: String,
    },
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
    SpawnFailed {
        message: String,
    },
    TimedOut {
        reason: TimeoutReason,
        output: String,
    },
    Cancelled,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded { .. })
    }

    fn terminal_event(&self) -> SessionEvent {
        match self {
            SessionOutcome::Succeeded { .. } => SessionEvent::Exited { success: true },
            SessionOutcome::Failed { .. } | SessionOutcome::SpawnFailed { .. } => {
                SessionEvent::Exited { success: false }
            }
            SessionOutcome::TimedOut {
                reason: TimeoutReason::HeartbeatLost,
                ..
            } => SessionEvent::HeartbeatLost,
            SessionOutcome::TimedOut {
                reason: TimeoutReason::BudgetExceeded,
                ..
            } => SessionEvent::BudgetExceeded,
            SessionOutcome::Cancelled => SessionEvent::Cancelled,
        }
    }

    fn output(&self) -> &str {
        match self {
            SessionOutcome::Succeeded { output }
            | SessionOutcome::Failed { output, .. }
            | SessionOutcome::TimedOut { output, .. } => output,
            SessionOutcome::SpawnFailed { message } => message,
            SessionOutcome::Cancelled => "",
        }
    }
}

/// Delivered once per session when it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: AgentSession,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    pub fn task_id(&self) -> Uuid {
        self.session.task_id
    }
}

/// Public view of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSession {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub agent_type: String,
    pub started_at: DateTime<Utc>,
}

struct LiveEntry {
    info: LiveSession,
    cancel: CancellationToken,
}

type LiveMap = Arc<Mutex<HashMap<Uuid, LiveEntry>>>;

// ---------------------------------------------------------------------------
// SessionSupervisor
// ---------------------------------------------------------------------------

/// Turns tasks into supervised worker sessions.
///
/// Each spawn persists a `starting` session and returns immediately; the
/// session is driven in a background task that enforces heartbeat and budget
/// deadlines and finally sends one [`SessionReport`].
pub struct SessionSupervisor {
    store: Arc<dyn TaskGraphStore>,
    registry: WorkerRegistry,
    policy: LifecyclePolicy,
    permits: Arc<Semaphore>,
    live: LiveMap,
    shutdown: CancellationToken,
    reports_tx: flume::Sender<SessionReport>,
    reports_rx: flume::Receiver<SessionReport>,
}

impl SessionSupervisor {
    pub fn new(
        store: Arc<dyn TaskGraphStore>,
        registry: WorkerRegistry,
        policy: LifecyclePolicy,
        max_concurrent: usize,
    ) -> Self {
        let (reports_tx, reports_rx) = flume::unbounded();
        Self {
            store,
            registry,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            live: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            reports_tx,
            reports_rx,
        }
    }

    /// Receiver for terminal session reports.
    pub fn reports(&self) -> flume::Receiver<SessionReport> {
        self.reports_rx.clone()
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Spawn one session for `task`.
    pub async fn spawn(&self, task: &Task, feedback: Option<RetryFeedback>) -> Result<AgentSession> {
        if self.shutdown.is_cancelled() {
            return Err(LifecycleError::ShuttingDown);
        }
        let worker = self.registry.resolve(task.agent_type.as_deref())?;

        let mut live = self.live.lock().await;
        if live.contains_key(&task.id) {
            return Err(LifecycleError::AlreadyRunning(task.id));
        }

        let session = AgentSession::new(task.id, worker.kind());
        self.store.upsert_session(&session).await?;

        let attempt = task.retry_count + 1;
        let cancel = self.shutdown.child_token();
        live.insert(
            task.id,
            LiveEntry {
                info: LiveSession {
                    task_id: task.id,
                    session_id: session.id,
                    agent_type: session.agent_type.clone(),
                    started_at: session.started_at,
                },
                cancel: cancel.clone(),
            },
        );
        drop(live);

        let budget = self.policy.budget_for(task);
        tracing::info!(
            task_id = %task.id,
            display_id = %task.display_id,
            session_id = %session.id,
            worker = %session.agent_type,
            attempt,
            budget_secs = budget.as_secs(),
            "agent session spawned"
        );

        let span = tf_telemetry::tracing_setup::session_span(
            &task.display_id,
            &session.id.to_string(),
            attempt,
        );
        let run = SupervisedRun {
            invocation: WorkerInvocation::for_task(task, session.id, attempt, feedback),
            session: session.clone(),
            worker,
            budget,
            policy: self.policy.clone(),
            cancel,
            permits: Arc::clone(&self.permits),
            store: Arc::clone(&self.store),
            live: Arc::clone(&self.live),
            reports: self.reports_tx.clone(),
        };
        tokio::spawn(run.supervise().instrument(span));

        Ok(session)
    }

    /// Kill the live session of `task_id`. Returns `false` when none is live.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        match self.live.lock().await.get(&task_id) {
            Some(entry) => {
                tracing::info!(task_id = %task_id, session_id = %entry.info.session_id, "cancelling agent session");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn live_sessions(&self) -> Vec<LiveSession> {
        let mut sessions: Vec<LiveSession> = self
            .live
            .lock()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn is_live(&self, task_id: Uuid) -> bool {
        self.live.lock().await.contains_key(&task_id)
    }

    /// Refuse new spawns and cancel every live session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Background supervision
// ---------------------------------------------------------------------------

struct SupervisedRun {
    invocation: WorkerInvocation,
    session: AgentSession,
    worker: Arc<dyn Worker>,
    budget: Duration,
    policy: LifecyclePolicy,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    store: Arc<dyn TaskGraphStore>,
    live: LiveMap,
    reports: flume::Sender<SessionReport>,
}

impl SupervisedRun {
    async fn supervise(mut self) {
        let mut sm = SessionStateMachine::new();
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        };
        let outcome = match permit {
            Some(permit) => {
                let outcome = self.drive(&mut sm).await;
                drop(permit);
                outcome
            }
            None => SessionOutcome::Cancelled,
        };

        if let Err(e) = sm.transition(outcome.terminal_event()) {
            tracing::warn!(error = %e, "unexpected terminal session transition");
        }
        self.session.status = sm.state();
        self.session.ended_at = Some(Utc::now());
        self.session.exit_code = match &outcome {
            SessionOutcome::Succeeded { .. } => Some(0),
            SessionOutcome::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };
        self.session.output = outcome.output().to_string();

        if let Err(e) = self.store.upsert_session(&self.session).await {
            tracing::warn!(error = %e, "failed to persist terminal session");
        }
        self.live.lock().await.remove(&self.session.task_id);

        tracing::info!(
            task_id = %self.session.task_id,
            session_id = %self.session.id,
            status = %self.session.status,
            exit_code = ?self.session.exit_code,
            "agent session finished"
        );
        let _ = self.reports.send(SessionReport {
            session: self.session,
            outcome,
        });
    }

    async fn drive(&mut self, sm: &mut SessionStateMachine) -> SessionOutcome {
        let (hb_tx, hb_rx) = heartbeat::channel();
        let worker_cancel = self.cancel.child_token();
        let worker = Arc::clone(&self.worker);
        let mut work = worker.execute(self.invocation.clone(), hb_tx, worker_cancel.clone());

        let mut tracker =
            HeartbeatTracker::new(self.policy.heartbeat_interval, self.policy.missed_heartbeats);
        let budget_deadline = Instant::now() + self.budget;
        let mut beats_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    stop_worker(&mut work, &worker_cancel, self.policy.kill_grace).await;
                    return SessionOutcome::Cancelled;
                }
                result = &mut work => return outcome_of(result),
                beat = hb_rx.recv_async(), if beats_open => match beat {
                    Ok(at) => {
                        tracker.record(at);
                        self.on_heartbeat(sm).await;
                    }
                    Err(_) => beats_open = false,
                },
                _ = tokio::time::sleep_until(tracker.deadline()) => {
                    tracing::warn!(
                        task_id = %self.session.task_id,
                        silent_secs = tracker.silence(Instant::now()).as_secs(),
                        "heartbeat lost, terminating worker"
                    );
                    let output = stop_worker(&mut work, &worker_cancel, self.policy.kill_grace).await;
                    return SessionOutcome::TimedOut { reason: TimeoutReason::HeartbeatLost, output };
                }
                _ = tokio::time::sleep_until(budget_deadline) => {
                    tracing::warn!(
                        task_id = %self.session.task_id,
                        budget_secs = self.budget.as_secs(),
                        "execution budget exceeded, killing worker"
                    );
                    let output = stop_worker(&mut work, &worker_cancel, self.policy.kill_grace).await;
                    return SessionOutcome::TimedOut { reason: TimeoutReason::BudgetExceeded, output };
                }
            }
        }
    }

    async fn on_heartbeat(&mut self, sm: &mut SessionStateMachine) {
        let was_starting = !matches!(sm.state(), tf_core::types::SessionStatus::Running);
        if let Err(e) = sm.transition(SessionEvent::Heartbeat) {
            tracing::debug!(error = %e, "heartbeat ignored");
            return;
        }
        self.session.status = sm.state();
        self.session.heartbeat_at = Some(Utc::now());
        if was_starting {
            tracing::debug!(session_id = %self.session.id, "first heartbeat, session running");
        }
        if let Err(e) = self.store.upsert_session(&self.session).await {
            tracing::warn!(error = %e, "failed to persist heartbeat");
        }
    }
}

fn outcome_of(result: std::result::Result<WorkerOutput, WorkerError>) -> SessionOutcome {
    match result {
        Ok(out) if out.exit_code == 0 => SessionOutcome::Succeeded { output: out.output },
        Ok(out) => SessionOutcome::Failed {
            exit_code: Some(out.exit_code),
            output: out.output,
        },
        Err(WorkerError::Spawn(message)) => SessionOutcome::SpawnFailed { message },
        Err(WorkerError::Io(message)) => SessionOutcome::Failed {
            exit_code: None,
            output: message,
        },
        Err(WorkerError::Cancelled { partial_output }) => SessionOutcome::Failed {
            exit_code: None,
            output: partial_output,
        },
    }
}

/// Cancel the worker and give it `grace` to exit; returns whatever output it
/// produced. Past the grace period the future is dropped, which kills any
/// child process.
async fn stop_worker<F>(work: &mut F, token: &CancellationToken, grace: Duration) -> String
where
    F: Future<Output = std::result::Result<WorkerOutput, WorkerError>> + Unpin,
{
    token.cancel();
    match tokio::time::timeout(grace, work).await {
        Ok(Ok(out)) => out.output,
        Ok(Err(WorkerError::Cancelled { partial_output })) => partial_output,
        Ok(Err(e)) => e.to_string(),
        Err(_) => {
            tracing::warn!(grace_secs = grace.as_secs(), "worker ignored cancellation");
            String::new()
        }
    }
}
