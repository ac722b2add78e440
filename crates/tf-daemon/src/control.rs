//! Control-surface operations that work directly against the store.
//!
//! The orchestrator routes its own `cancel` / `resume` commands through these
//! functions so that the same rules apply whether or not a run is active.

use serde::{Deserialize, Serialize};
use tf_core::config::RetryConfig;
use tf_core::store::{StoreError, TaskGraphStore};
use tf_core::types::{AgentSession, RetryAttempt, Task, TaskStatus, ValidationRun};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {display_id} is already {status}")]
    AlreadyTerminal {
        display_id: String,
        status: TaskStatus,
    },

    #[error("task {display_id} is {status}; only blocked tasks can be resumed")]
    NotResumable {
        display_id: String,
        status: TaskStatus,
    },

    #[error("manual resume is disabled by retry.allow_manual_resume")]
    ResumeDisabled,

    /// Cancelling a running task needs the live orchestrator.
    #[error("task {0} is running; cancel it through the running orchestrator")]
    Running(String),

    #[error("orchestrator is not running")]
    Stopped,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Everything needed to answer "why did this task end up here".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task: Task,
    pub sessions: Vec<AgentSession>,
    pub retry_attempts: Vec<RetryAttempt>,
    pub validation_runs: Vec<ValidationRun>,
}

/// Resolve a task by uuid or display id.
pub async fn find_task(store: &dyn TaskGraphStore, key: &str) -> Result<Task> {
    let found = match Uuid::parse_str(key) {
        Ok(id) => store.get_task(id).await?,
        Err(_) => store.get_task_by_display_id(key).await?,
    };
    found.ok_or_else(|| ControlError::NotFound(key.to_string()))
}

pub async fn task_history(store: &dyn TaskGraphStore, task_id: Uuid) -> Result<TaskHistory> {
    let task = store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ControlError::NotFound(task_id.to_string()))?;
    let mut sessions = store.list_sessions_for_task(task_id).await?;
    sessions.sort_by_key(|s| s.started_at);
    let retry_attempts = store.list_retry_attempts(task_id).await?;
    let mut validation_runs = store.list_validation_runs(task_id).await?;
    validation_runs.sort_by_key(|r| r.started_at);
    Ok(TaskHistory {
        task,
        sessions,
        retry_attempts,
        validation_runs,
    })
}

/// Move an escalated (`blocked`) task back to `pending`.
///
/// The retry log is left untouched, so per-kind and total caps keep counting
/// earlier attempts.
pub async fn resume_task(
    store: &dyn TaskGraphStore,
    policy: &RetryConfig,
    task_id: Uuid,
) -> Result<Task> {
    if !policy.allow_manual_resume {
        return Err(ControlError::ResumeDisabled);
    }
    let mut task = store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ControlError::NotFound(task_id.to_string()))?;
    if task.status != TaskStatus::Blocked {
        return Err(ControlError::NotResumable {
            display_id: task.display_id,
            status: task.status,
        });
    }
    task.set_status(TaskStatus::Pending);
    store.update_task(&task).await?;
    tracing::info!(task_id = %task.id, display_id = %task.display_id, "task resumed");
    Ok(task)
}

/// Skip a task that has no live session.
pub async fn cancel_task(store: &dyn TaskGraphStore, task_id: Uuid) -> Result<Task> {
    let task = store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ControlError::NotFound(task_id.to_string()))?;
    match task.status {
        TaskStatus::InProgress => Err(ControlError::Running(task.display_id)),
        status if status.is_terminal() => Err(ControlError::AlreadyTerminal {
            display_id: task.display_id,
            status,
        }),
        _ => skip_task(store, task, "cancelled").await,
    }
}

pub(crate) async fn skip_task(
    store: &dyn TaskGraphStore,
    mut task: Task,
    reason: &str,
) -> Result<Task> {
    task.set_status(TaskStatus::Skipped);
    task.last_error = Some(match task.last_error.take() {
        Some(prev) => format!("{reason} (last error: {prev})"),
        None => reason.to_string(),
    });
    store.update_task(&task).await?;
    tracing::info!(task_id = %task.id, display_id = %task.display_id, reason, "task skipped");
    Ok(task)
}
