use std::time::Duration;

use tf_core::config::AgentsConfig;
use tf_core::store::StoreError;
use tf_core::types::Task;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors raised while turning a task into a supervised session.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("no worker registered for agent type '{0}'")]
    UnknownWorker(String),

    #[error("no worker configured and task declares no agent type")]
    NoWorker,

    /// A session for this task is still live.
    #[error("task {0} already has a live session")]
    AlreadyRunning(Uuid),

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("state machine error: {0}")]
    StateMachine(#[from] crate::state_machine::StateMachineError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

// ---------------------------------------------------------------------------
// LifecyclePolicy
// ---------------------------------------------------------------------------

/// Timing and capture limits applied to every session.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    pub heartbeat_interval: Duration,
    pub missed_heartbeats: u32,
    pub min_budget: Duration,
    pub max_budget: Duration,
    pub output_capture_bytes: usize,
    /// How long a worker gets to exit after being told to stop.
    pub kill_grace: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from_config(&AgentsConfig::default())
    }
}

impl LifecyclePolicy {
    pub fn from_config(cfg: &AgentsConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
            missed_heartbeats: cfg.missed_heartbeats,
            min_budget: Duration::from_secs(cfg.min_budget_secs),
            max_budget: Duration::from_secs(cfg.max_budget_secs),
            output_capture_bytes: cfg.output_capture_bytes,
            kill_grace: Duration::from_secs(5),
        }
    }

    /// Hard wall-clock budget for one session of `task`.
    ///
    /// An explicit per-task budget wins; otherwise the minimum budget is
    /// scaled by declared effort and clamped to `[min_budget, max_budget]`.
    pub fn budget_for(&self, task: &Task) -> Duration {
        if let Some(secs) = task.budget_secs {
            return Duration::from_secs(secs);
        }
        let scaled = self.min_budget.mul_f64(task.effort.budget_factor());
        scaled.clamp(self.min_budget, self.max_budget.max(self.min_budget))
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }

    /// Upper bound on how long a session without an explicit budget can
    /// stay live.
    pub fn max_session_time(&self) -> Duration {
        self.max_budget + self.kill_grace
    }

    /// Upper bound on how long a session of `task` can stay live.
    pub fn session_time(&self, task: &Task) -> Duration {
        self.budget_for(task) + self.kill_grace
    }
}
