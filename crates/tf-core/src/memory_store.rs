//! In-process Task Graph Store.
//!
//! Same contract as [`SqliteStore`](crate::store::SqliteStore) without a
//! database thread, so callers driving paused tokio time see every write
//! complete without the clock moving. Used for dry runs and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::graph::{DependencyIndex, GraphError};
use crate::store::{PatternMemory, Result, StoreError, TaskGraphStore};
use crate::types::{
    AgentSession, PatternOutcome, PatternRecord, RetryAttempt, StatusCounts, Task, TaskRelationship,
    TaskStatus, ValidationRun,
};

#[derive(Default)]
struct Inner {
    tasks: Vec<Task>,
    relationships: Vec<TaskRelationship>,
    sessions: Vec<AgentSession>,
    retry_attempts: Vec<RetryAttempt>,
    validation_runs: Vec<ValidationRun>,
    patterns: Vec<PatternRecord>,
}

impl Inner {
    fn retry_count(&self, task_id: Uuid) -> u32 {
        self.retry_attempts
            .iter()
            .filter(|a| a.task_id == task_id)
            .count() as u32
    }

    fn materialize(&self, task: &Task) -> Task {
        let mut task = task.clone();
        task.retry_count = self.retry_count(task.id);
        task
    }

    fn has_task(&self, id: Uuid) -> bool {
        self.tasks.iter().any(|t| t.id == id)
    }

    fn display(&self, id: Uuid) -> String {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.display_id.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("memory store lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

#[async_trait]
impl TaskGraphStore for MemoryStore {
    async fn insert_graph(&self, tasks: &[Task], relationships: &[TaskRelationship]) -> Result<()> {
        let mut inner = self.lock();
        for (i, task) in tasks.iter().enumerate() {
            let clash = inner.has_task(task.id)
                || tasks[..i].iter().any(|t| t.id == task.id)
                || inner
                    .tasks
                    .iter()
                    .chain(tasks[..i].iter())
                    .any(|t| t.task_list_id == task.task_list_id && t.display_id == task.display_id);
            if clash {
                return Err(StoreError::Constraint(format!(
                    "task {} already exists",
                    task.display_id
                )));
            }
        }
        for rel in relationships {
            for end in [rel.from_task, rel.to_task] {
                if !inner.has_task(end) && !tasks.iter().any(|t| t.id == end) {
                    return Err(StoreError::Constraint(format!(
                        "relationship {} references unknown task {end}",
                        rel.id
                    )));
                }
            }
        }
        inner.tasks.extend(tasks.iter().cloned());
        inner.relationships.extend(relationships.iter().cloned());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .iter()
            .find(|t| t.id == id)
            .map(|t| inner.materialize(t)))
    }

    async fn get_task_by_display_id(&self, display_id: &str) -> Result<Option<Task>> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .iter()
            .filter(|t| t.display_id == display_id)
            .max_by_key(|t| (t.created_at, t.sequence))
            .map(|t| inner.materialize(t)))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner.tasks.iter().map(|t| inner.materialize(t)).collect();
        tasks.sort_by_key(|t| (t.sequence, t.created_at));
        Ok(tasks)
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock();
        let stored = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;
        if stored.status != task.status && !stored.status.can_transition_to(&task.status) {
            return Err(StoreError::InvalidTransition {
                task_id: task.id,
                from: stored.status,
                to: task.status,
            });
        }
        let (display_id, task_list_id, sequence, created_at) = (
            stored.display_id.clone(),
            stored.task_list_id,
            stored.sequence,
            stored.created_at,
        );
        *stored = Task {
            display_id,
            task_list_id,
            sequence,
            created_at,
            ..task.clone()
        };
        Ok(())
    }

    async fn list_relationships(&self) -> Result<Vec<TaskRelationship>> {
        Ok(self.lock().relationships.clone())
    }

    async fn insert_relationship(&self, rel: &TaskRelationship) -> Result<()> {
        let mut inner = self.lock();
        if rel.from_task == rel.to_task {
            return Err(GraphError::SelfReference(inner.display(rel.from_task)).into());
        }
        for end in [rel.from_task, rel.to_task] {
            if !inner.has_task(end) {
                return Err(StoreError::TaskNotFound(end));
            }
        }
        if let Some((waiter, prereq)) = rel.as_dependency() {
            let index = DependencyIndex::from_relationships(&inner.relationships);
            if let Some(cycle) = index.cycle_with(waiter, prereq) {
                let path = cycle.into_iter().map(|id| inner.display(id)).collect();
                return Err(GraphError::Cycle { path }.into());
            }
        }
        inner.relationships.push(rel.clone());
        Ok(())
    }

    async fn upsert_session(&self, session: &AgentSession) -> Result<()> {
        let mut inner = self.lock();
        match inner.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => inner.sessions.push(session.clone()),
        }
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<AgentSession>> {
        Ok(self.lock().sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sessions_for_task(&self, task_id: Uuid) -> Result<Vec<AgentSession>> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn append_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let mut inner = self.lock();
        let duplicate = inner
            .retry_attempts
            .iter()
            .any(|a| a.id == attempt.id || (a.task_id == attempt.task_id && a.attempt == attempt.attempt));
        if duplicate {
            return Err(StoreError::Constraint(format!(
                "retry attempt {} for task {} already recorded",
                attempt.attempt, attempt.task_id
            )));
        }
        inner.retry_attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_retry_attempts(&self, task_id: Uuid) -> Result<Vec<RetryAttempt>> {
        let mut attempts: Vec<RetryAttempt> = self
            .lock()
            .retry_attempts
            .iter()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt);
        Ok(attempts)
    }

    async fn append_validation_run(&self, run: &ValidationRun) -> Result<()> {
        self.lock().validation_runs.push(run.clone());
        Ok(())
    }

    async fn list_validation_runs(&self, task_id: Uuid) -> Result<Vec<ValidationRun>> {
        Ok(self
            .lock()
            .validation_runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for task in &self.lock().tasks {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl PatternMemory for MemoryStore {
    async fn record_pattern(&self, record: &PatternRecord) -> Result<()> {
        self.lock().patterns.push(record.clone());
        Ok(())
    }

    async fn recent_patterns(
        &self,
        outcome: Option<PatternOutcome>,
        limit: usize,
    ) -> Result<Vec<PatternRecord>> {
        Ok(self
            .lock()
            .patterns
            .iter()
            .rev()
            .filter(|p| outcome.is_none_or(|o| p.outcome == o))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    #[tokio::test]
    async fn update_rejects_invalid_transition() {
        let store = MemoryStore::new();
        let task = Task::new("T1", "t", Uuid::new_v4());
        store.insert_graph(&[task.clone()], &[]).await.unwrap();

        let mut done = task.clone();
        done.status = TaskStatus::Completed;
        assert!(matches!(
            store.update_task(&done).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn retry_count_follows_log() {
        let store = MemoryStore::new();
        let mut task = Task::new("T1", "t", Uuid::new_v4());
        task.retry_count = 7;
        store.insert_graph(&[task.clone()], &[]).await.unwrap();
        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 0);
    }
}
