use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tf_agents::executor::WorkerRegistry;
use tf_agents::lifecycle::{LifecycleError, LifecyclePolicy};
use tf_agents::retry::{FailureSignal, RetryClassifier};
use tf_agents::supervisor::{SessionOutcome, SessionReport, SessionSupervisor};
use tf_core::config::{Config, RetryConfig};
use tf_core::store::{PatternMemory, StoreError, TaskGraphStore};
use tf_core::types::{
    ErrorKind, PatternOutcome, PatternRecord, RetryDecision, RetryFeedback, SessionStatus,
    StatusCounts, Task, TaskStatus, ValidationRun,
};
use tf_telemetry::tracing_setup;
use tf_validation::engine::{ValidationEngine, ValidationError};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::control::{self, ControlError};
use crate::scheduler::{PlanContext, StallReport, WavePlan, WaveScheduler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Pending tasks remain but none can ever become eligible.
    #[error("scheduling stall: {0}")]
    SchedulingStall(StallReport),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("control error: {0}")]
    Control(#[from] ControlError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
    Stalled,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPhase {
    Executing,
    Validating,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightTask {
    pub task_id: Uuid,
    pub display_id: String,
    pub session_id: Uuid,
    pub phase: InFlightPhase,
}

/// Snapshot published after every orchestrator step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveStatus {
    pub state: RunState,
    /// Number of waves started so far.
    pub wave: u64,
    pub in_flight: Vec<InFlightTask>,
    pub counts: StatusCounts,
    pub sessions_spawned: u64,
    pub retries: u64,
    pub escalations: u64,
    pub aborts: u64,
}

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

/// Commands accepted by a running orchestrator.
#[derive(Debug)]
pub enum Control {
    Cancel {
        task_id: Uuid,
        reply: oneshot::Sender<control::Result<()>>,
    },
    Resume {
        task_id: Uuid,
        reply: oneshot::Sender<control::Result<()>>,
    },
    PauseTaskList {
        task_list_id: Uuid,
        reply: oneshot::Sender<control::Result<usize>>,
    },
    Shutdown,
}

/// Cloneable entry point for callers outside the control loop.
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: flume::Sender<Control>,
    status: watch::Receiver<WaveStatus>,
}

impl OrchestratorHandle {
    pub async fn cancel_task(&self, task_id: Uuid) -> control::Result<()> {
        self.request(|reply| Control::Cancel { task_id, reply }).await
    }

    pub async fn resume_task(&self, task_id: Uuid) -> control::Result<()> {
        self.request(|reply| Control::Resume { task_id, reply }).await
    }

    /// Cancel running sessions of a task list and skip its pending tasks.
    /// Returns the number of tasks affected.
    pub async fn pause_task_list(&self, task_list_id: Uuid) -> control::Result<usize> {
        self.request(|reply| Control::PauseTaskList {
            task_list_id,
            reply,
        })
        .await
    }

    /// Ask the loop to stop: live sessions are cancelled and their tasks go
    /// back to pending.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    pub fn wave_status(&self) -> WaveStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WaveStatus> {
        self.status.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<control::Result<T>>) -> Control,
    ) -> control::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send_async(make(tx))
            .await
            .map_err(|_| ControlError::Stopped)?;
        rx.await.map_err(|_| ControlError::Stopped)?
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct ValidationDone {
    task_id: Uuid,
    session_id: Uuid,
    result: std::result::Result<ValidationRun, ValidationError>,
}

enum Step {
    Spawned,
    /// Tasks changed status without any session starting; plan again
    /// before waiting.
    Settled,
    Waiting,
    Complete,
}

enum Launch {
    Dispatched,
    Settled,
    Refused,
}

/// The single writer of task status.
///
/// Each step plans a wave from the current store snapshot, spawns it, then
/// waits for exactly one event: a session report, a finished validation, a
/// control command or a backoff deadline.
pub struct Orchestrator {
    store: Arc<dyn TaskGraphStore>,
    patterns: Option<Arc<dyn PatternMemory>>,
    supervisor: SessionSupervisor,
    reports: flume::Receiver<SessionReport>,
    classifier: RetryClassifier,
    validator: ValidationEngine,
    retry_policy: RetryConfig,
    max_wave_size: usize,
    max_concurrent: usize,
    event_bound: Duration,
    check_timeout: Duration,
    project: String,
    trace_id: String,

    control_tx: flume::Sender<Control>,
    control_rx: flume::Receiver<Control>,
    validations_tx: flume::Sender<ValidationDone>,
    validations_rx: flume::Receiver<ValidationDone>,
    status_tx: watch::Sender<WaveStatus>,

    in_flight: HashMap<Uuid, InFlightTask>,
    deferred: HashMap<Uuid, Instant>,
    feedback: HashMap<Uuid, RetryFeedback>,
    cancelled: HashSet<Uuid>,
    stopping: bool,
    status: WaveStatus,
}

impl Orchestrator {
    pub fn new(config: &Config, store: Arc<dyn TaskGraphStore>, registry: WorkerRegistry) -> Self {
        let policy = LifecyclePolicy::from_config(&config.agents);
        let check_timeout = Duration::from_secs(config.validation.check_timeout_secs);
        let event_bound = policy.max_session_time() + check_timeout;
        let supervisor = SessionSupervisor::new(
            Arc::clone(&store),
            registry,
            policy,
            config.scheduler.max_concurrent_sessions,
        );
        let reports = supervisor.reports();
        let (control_tx, control_rx) = flume::unbounded();
        let (validations_tx, validations_rx) = flume::unbounded();
        let (status_tx, _) = watch::channel(WaveStatus::default());

        Self {
            store,
            patterns: None,
            supervisor,
            reports,
            classifier: RetryClassifier::new(config.retry.clone()),
            validator: ValidationEngine::new(
                config.validation.clone(),
                config.general.workspace_root(),
            ),
            retry_policy: config.retry.clone(),
            max_wave_size: config.scheduler.max_wave_size,
            max_concurrent: config.scheduler.max_concurrent_sessions.max(1),
            event_bound,
            check_timeout,
            project: config.general.project_name.clone(),
            trace_id: tracing_setup::generate_trace_id(),
            control_tx,
            control_rx,
            validations_tx,
            validations_rx,
            status_tx,
            in_flight: HashMap::new(),
            deferred: HashMap::new(),
            feedback: HashMap::new(),
            cancelled: HashSet::new(),
            stopping: false,
            status: WaveStatus::default(),
        }
    }

    pub fn with_patterns(mut self, patterns: Arc<dyn PatternMemory>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn with_validator(mut self, validator: ValidationEngine) -> Self {
        self.validator = validator;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            control: self.control_tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn status(&self) -> WaveStatus {
        self.status.clone()
    }

    /// Plan and spawn one wave without waiting for any outcome.
    pub async fn start_wave(&mut self) -> Result<WaveStatus> {
        if self.status.state == RunState::Idle {
            self.status.state = RunState::Running;
        }
        let step = self.advance().await;
        if let Err(OrchestratorError::SchedulingStall(_)) = &step {
            self.status.state = RunState::Stalled;
        }
        self.publish().await;
        step?;
        Ok(self.status())
    }

    /// Drive the task graph until nothing is left to schedule, a shutdown
    /// completes, or the schedule stalls.
    pub async fn run(mut self) -> Result<WaveStatus> {
        let (span, trace_id) = tracing_setup::run_span(&self.project);
        self.trace_id = trace_id;
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> Result<WaveStatus> {
        info!("orchestrator started");
        self.status.state = RunState::Running;
        self.recover_interrupted().await?;

        loop {
            if self.stopping {
                if self.in_flight.is_empty() {
                    self.status.state = RunState::Stopped;
                    self.publish().await;
                    info!(counts = ?self.status.counts, "orchestrator stopped");
                    return Ok(self.status());
                }
            } else {
                match self.advance().await {
                    Ok(Step::Complete) => {
                        self.status.state = RunState::Complete;
                        self.publish().await;
                        info!(
                            waves = self.status.wave,
                            counts = ?self.status.counts,
                            "all tasks settled"
                        );
                        return Ok(self.status());
                    }
                    Ok(Step::Settled) => {
                        self.publish().await;
                        continue;
                    }
                    Ok(Step::Spawned | Step::Waiting) => {}
                    Err(OrchestratorError::SchedulingStall(report)) => {
                        self.status.state = RunState::Stalled;
                        self.publish().await;
                        error!(
                            kind = "scheduling_stall",
                            stall = %report,
                            "pending tasks can never become eligible"
                        );
                        return Err(OrchestratorError::SchedulingStall(report));
                    }
                    Err(e) => return Err(e),
                }
            }
            self.publish().await;
            self.next_event().await?;
        }
    }

    // -- planning ----------------------------------------------------------

    async fn advance(&mut self) -> Result<Step> {
        self.release_due_deferrals();
        if self.stopping {
            return Ok(Step::Waiting);
        }

        let tasks = self.store.list_tasks().await?;
        let relationships = self.store.list_relationships().await?;
        let live = self.supervisor.live_count().await;
        let slots = self.max_concurrent.saturating_sub(live);
        let capacity = match self.max_wave_size {
            0 => slots,
            max => slots.min(max),
        };
        let ctx = PlanContext {
            deferred: self.deferred.keys().copied().collect(),
            capacity: Some(capacity),
        };

        match WaveScheduler::plan(&tasks, &relationships, &ctx) {
            WavePlan::Ready(wave) => self.spawn_wave(wave).await,
            WavePlan::Waiting => Ok(Step::Waiting),
            WavePlan::Complete => Ok(Step::Complete),
            WavePlan::Stalled(report) => Err(OrchestratorError::SchedulingStall(report)),
        }
    }

    fn release_due_deferrals(&mut self) {
        let now = Instant::now();
        self.deferred.retain(|task_id, due| {
            let keep = *due > now;
            if !keep {
                debug!(task_id = %task_id, "backoff elapsed");
            }
            keep
        });
    }

    async fn spawn_wave(&mut self, wave: Vec<Task>) -> Result<Step> {
        self.status.wave += 1;
        let span = tracing_setup::wave_span(&self.trace_id, self.status.wave);
        async {
            let ids: Vec<&str> = wave.iter().map(|t| t.display_id.as_str()).collect();
            info!(wave = self.status.wave, tasks = ?ids, "wave started");
            let (mut dispatched, mut settled) = (0usize, 0usize);
            for task in wave {
                match self.launch(task).await? {
                    Launch::Dispatched => dispatched += 1,
                    Launch::Settled => settled += 1,
                    Launch::Refused => {}
                }
            }
            let step = match (dispatched, settled) {
                (0, 0) => Step::Waiting,
                (0, _) => Step::Settled,
                _ => Step::Spawned,
            };
            Ok::<Step, OrchestratorError>(step)
        }
        .instrument(span)
        .await
    }

    async fn launch(&mut self, mut task: Task) -> Result<Launch> {
        let feedback = self.feedback.remove(&task.id);
        match self.supervisor.spawn(&task, feedback.clone()).await {
            Ok(session) => {
                let bound = self.supervisor.policy().session_time(&task) + self.check_timeout;
                self.event_bound = self.event_bound.max(bound);
                task.set_status(TaskStatus::InProgress);
                task.current_session_id = Some(session.id);
                self.store.update_task(&task).await?;
                self.in_flight.insert(
                    task.id,
                    InFlightTask {
                        task_id: task.id,
                        display_id: task.display_id.clone(),
                        session_id: session.id,
                        phase: InFlightPhase::Executing,
                    },
                );
                self.status.sessions_spawned += 1;
                Ok(Launch::Dispatched)
            }
            Err(e @ (LifecycleError::UnknownWorker(_) | LifecycleError::NoWorker)) => {
                warn!(task_id = %task.id, error = %e, "task cannot be dispatched");
                task.set_status(TaskStatus::InProgress);
                self.store.update_task(&task).await?;
                self.handle_failure(
                    task,
                    None,
                    FailureSignal::Misconfigured {
                        message: e.to_string(),
                    },
                )
                .await?;
                Ok(Launch::Settled)
            }
            // Refused spawns are retried after the base backoff.
            Err(e) => {
                let delay = Duration::from_millis(self.retry_policy.backoff_base_ms.max(1));
                warn!(
                    task_id = %task.id,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "spawn refused, task stays pending"
                );
                self.deferred.insert(task.id, Instant::now() + delay);
                if let Some(fb) = feedback {
                    self.feedback.insert(task.id, fb);
                }
                Ok(Launch::Refused)
            }
        }
    }

    // -- events ------------------------------------------------------------

    async fn next_event(&mut self) -> Result<()> {
        let wake = self.deferred.values().min().copied();
        tokio::select! {
            biased;

            Ok(cmd) = self.control_rx.recv_async() => self.on_control(cmd).await,
            Ok(report) = self.reports.recv_async() => self.on_session_report(report).await,
            Ok(done) = self.validations_rx.recv_async() => self.on_validation(done).await,
            _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => Ok(()),
            _ = tokio::time::sleep(self.event_bound) => {
                warn!(
                    bound_secs = self.event_bound.as_secs(),
                    in_flight = self.in_flight.len(),
                    "no orchestrator event within bound"
                );
                Ok(())
            }
        }
    }

    async fn on_session_report(&mut self, report: SessionReport) -> Result<()> {
        let task_id = report.task_id();
        self.in_flight.remove(&task_id);
        let Some(task) = self.store.get_task(task_id).await? else {
            warn!(task_id = %task_id, "session report for unknown task");
            return Ok(());
        };

        if self.cancelled.remove(&task_id) {
            control::skip_task(self.store.as_ref(), task, "cancelled").await?;
            return Ok(());
        }

        match &report.outcome {
            SessionOutcome::Succeeded { .. } => self.start_validation(task, report.session.id),
            SessionOutcome::Cancelled => {
                self.requeue(task, "session interrupted before completion")
                    .await?;
            }
            outcome => {
                if let Some(signal) = FailureSignal::from_outcome(outcome) {
                    self.handle_failure(task, Some(report.session.id), signal)
                        .await?;
                }
            }
        }
        Ok(())
    }

    fn start_validation(&mut self, task: Task, session_id: Uuid) {
        let level = self.validator.select_level(&task);
        self.in_flight.insert(
            task.id,
            InFlightTask {
                task_id: task.id,
                display_id: task.display_id.clone(),
                session_id,
                phase: InFlightPhase::Validating,
            },
        );

        let validator = self.validator.clone();
        let store = Arc::clone(&self.store);
        let done = self.validations_tx.clone();
        let span = tracing::info_span!("validation", task_id = %task.id, level = %level);
        tokio::spawn(
            async move {
                let result = validator
                    .validate_and_record(store.as_ref(), &task, level, Some(session_id))
                    .await;
                let _ = done.send(ValidationDone {
                    task_id: task.id,
                    session_id,
                    result,
                });
            }
            .instrument(span),
        );
    }

    async fn on_validation(&mut self, done: ValidationDone) -> Result<()> {
        self.in_flight.remove(&done.task_id);
        let Some(mut task) = self.store.get_task(done.task_id).await? else {
            return Ok(());
        };

        if self.cancelled.remove(&task.id) {
            control::skip_task(self.store.as_ref(), task, "cancelled").await?;
            return Ok(());
        }

        match done.result {
            Ok(run) if run.passed => {
                task.set_status(TaskStatus::Completed);
                self.store.update_task(&task).await?;
                info!(
                    task_id = %task.id,
                    display_id = %task.display_id,
                    level = %run.level,
                    "task completed"
                );
                self.record_pattern(task.id, PatternOutcome::Success, None, task.title.clone())
                    .await;
            }
            Ok(run) => {
                self.handle_failure(task, Some(done.session_id), FailureSignal::Validation { run })
                    .await?;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "validation run could not be recorded");
                let signal = FailureSignal::Exit {
                    exit_code: None,
                    output: format!("validation could not be recorded: {e}"),
                };
                self.handle_failure(task, Some(done.session_id), signal)
                    .await?;
            }
        }
        Ok(())
    }

    /// Classify a failure, append the decision and apply it to the task.
    async fn handle_failure(
        &mut self,
        mut task: Task,
        session_id: Option<Uuid>,
        signal: FailureSignal,
    ) -> Result<()> {
        let history = self.store.list_retry_attempts(task.id).await?;
        let Some(attempt) = self.classifier.decide(&task, session_id, &signal, &history) else {
            return self.requeue(task, "session cancelled").await;
        };
        self.store.append_retry_attempt(&attempt).await?;
        self.record_pattern(
            task.id,
            PatternOutcome::Error,
            Some(attempt.error_kind),
            signal.signature(),
        )
        .await;

        task.retry_count = attempt.attempt;
        task.last_error = Some(format!("{}: {}", signal.failure_class(), attempt.reason));

        match attempt.decision {
            RetryDecision::Retry => {
                task.set_status(TaskStatus::Failed);
                self.store.update_task(&task).await?;
                task.set_status(TaskStatus::Pending);
                self.store.update_task(&task).await?;
                if attempt.backoff_ms > 0 {
                    self.deferred.insert(
                        task.id,
                        Instant::now() + Duration::from_millis(attempt.backoff_ms),
                    );
                }
                if let Some(feedback) = attempt.feedback.clone() {
                    self.feedback.insert(task.id, feedback);
                }
                self.status.retries += 1;
                info!(
                    task_id = %task.id,
                    display_id = %task.display_id,
                    attempt = attempt.attempt,
                    kind = %attempt.error_kind,
                    decision = %attempt.decision,
                    backoff_ms = attempt.backoff_ms,
                    "task requeued for retry"
                );
            }
            RetryDecision::Escalate => {
                task.set_status(TaskStatus::Blocked);
                self.store.update_task(&task).await?;
                self.status.escalations += 1;
                warn!(
                    task_id = %task.id,
                    display_id = %task.display_id,
                    kind = %attempt.error_kind,
                    decision = %attempt.decision,
                    reason = %attempt.reason,
                    "task escalated"
                );
            }
            RetryDecision::Abort => {
                task.set_status(TaskStatus::Failed);
                self.store.update_task(&task).await?;
                self.status.aborts += 1;
                error!(
                    task_id = %task.id,
                    display_id = %task.display_id,
                    kind = %attempt.error_kind,
                    decision = %attempt.decision,
                    reason = %attempt.reason,
                    "task aborted"
                );
            }
        }
        Ok(())
    }

    /// Return an interrupted task to pending without recording an attempt.
    async fn requeue(&self, mut task: Task, reason: &str) -> Result<()> {
        if task.status != TaskStatus::InProgress {
            return Ok(());
        }
        task.last_error = Some(reason.to_string());
        task.set_status(TaskStatus::Failed);
        self.store.update_task(&task).await?;
        task.set_status(TaskStatus::Pending);
        self.store.update_task(&task).await?;
        debug!(task_id = %task.id, reason, "task requeued");
        Ok(())
    }

    /// Tasks left in progress by an earlier run have no live session; kill
    /// their stale session rows and put them back to pending.
    async fn recover_interrupted(&mut self) -> Result<()> {
        for task in self.store.list_tasks_by_status(TaskStatus::InProgress).await? {
            if self.in_flight.contains_key(&task.id) {
                continue;
            }
            for mut session in self.store.list_sessions_for_task(task.id).await? {
                if !session.status.is_terminal() {
                    session.status = SessionStatus::Killed;
                    session.ended_at = Some(Utc::now());
                    self.store.upsert_session(&session).await?;
                }
            }
            warn!(task_id = %task.id, display_id = %task.display_id, "recovering interrupted task");
            self.requeue(task, "interrupted: orchestrator restarted")
                .await?;
        }
        Ok(())
    }

    // -- control -----------------------------------------------------------

    async fn on_control(&mut self, cmd: Control) -> Result<()> {
        match cmd {
            Control::Cancel { task_id, reply } => {
                let result = self.cancel(task_id).await;
                let _ = reply.send(result);
            }
            Control::Resume { task_id, reply } => {
                let result = control::resume_task(self.store.as_ref(), &self.retry_policy, task_id)
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            Control::PauseTaskList {
                task_list_id,
                reply,
            } => {
                let result = self.pause_task_list(task_list_id).await;
                let _ = reply.send(result);
            }
            Control::Shutdown => {
                if !self.stopping {
                    info!(in_flight = self.in_flight.len(), "shutdown requested");
                    self.stopping = true;
                    self.status.state = RunState::Stopping;
                    self.supervisor.shutdown();
                }
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, task_id: Uuid) -> control::Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(task_id.to_string()))?;
        self.deferred.remove(&task_id);
        self.feedback.remove(&task_id);

        if task.status == TaskStatus::InProgress {
            match self.in_flight.get(&task_id).map(|t| t.phase) {
                Some(InFlightPhase::Executing) => {
                    self.cancelled.insert(task_id);
                    self.supervisor.cancel(task_id).await;
                }
                // The validation result is discarded when it arrives.
                Some(InFlightPhase::Validating) => {
                    self.cancelled.insert(task_id);
                }
                None => {
                    control::skip_task(self.store.as_ref(), task, "cancelled").await?;
                }
            }
            info!(task_id = %task_id, "task cancellation requested");
            return Ok(());
        }
        control::cancel_task(self.store.as_ref(), task_id)
            .await
            .map(|_| ())
    }

    async fn pause_task_list(&mut self, task_list_id: Uuid) -> control::Result<usize> {
        let tasks: Vec<Task> = self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.task_list_id == task_list_id)
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .collect();
        let affected = tasks.len();
        for task in tasks {
            self.cancel(task.id).await?;
        }
        info!(task_list_id = %task_list_id, affected, "task list paused");
        Ok(affected)
    }

    // -- reporting ---------------------------------------------------------

    async fn record_pattern(
        &self,
        task_id: Uuid,
        outcome: PatternOutcome,
        error_kind: Option<ErrorKind>,
        signature: String,
    ) {
        let Some(patterns) = &self.patterns else {
            return;
        };
        let record = PatternRecord {
            id: Uuid::new_v4(),
            task_id,
            outcome,
            error_kind,
            signature,
            created_at: Utc::now(),
        };
        if let Err(e) = patterns.record_pattern(&record).await {
            warn!(error = %e, "failed to record pattern");
        }
    }

    async fn publish(&mut self) {
        match self.store.status_counts().await {
            Ok(counts) => self.status.counts = counts,
            Err(e) => warn!(error = %e, "failed to refresh status counts"),
        }
        let mut in_flight: Vec<InFlightTask> = self.in_flight.values().cloned().collect();
        in_flight.sort_by(|a, b| a.display_id.cmp(&b.display_id));
        self.status.in_flight = in_flight;
        self.status_tx.send_replace(self.status.clone());
    }
}
