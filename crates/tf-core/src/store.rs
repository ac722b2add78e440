//! Task Graph Store: the narrow persistence surface for tasks, relationships,
//! agent sessions and the append-only retry/validation logs.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::graph::{DependencyIndex, GraphError};
use crate::types::{
    AgentSession, PatternOutcome, PatternRecord, RetryAttempt, StatusCounts, Task, TaskRelationship,
    TaskStatus, ValidationRun,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(inner) => inner.into(),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(err.to_string()),
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Durable record of tasks, their relationships and the per-task logs.
///
/// Only the orchestrator's control loop writes task status; append-only
/// records have no update path.
#[async_trait]
pub trait TaskGraphStore: Send + Sync {
    /// Persist a validated graph in one transaction: all rows or none.
    async fn insert_graph(&self, tasks: &[Task], relationships: &[TaskRelationship]) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    /// Most recently created task with this display id.
    async fn get_task_by_display_id(&self, display_id: &str) -> Result<Option<Task>>;
    /// All tasks in creation order.
    async fn list_tasks(&self) -> Result<Vec<Task>>;
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    /// Write mutable task fields; a status change must be a valid transition
    /// from the stored status.
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn list_relationships(&self) -> Result<Vec<TaskRelationship>>;
    /// Insert one edge, rejecting it if it would close a dependency cycle in
    /// the stored graph.
    async fn insert_relationship(&self, rel: &TaskRelationship) -> Result<()>;

    async fn upsert_session(&self, session: &AgentSession) -> Result<()>;
    async fn get_session(&self, id: Uuid) -> Result<Option<AgentSession>>;
    async fn list_sessions_for_task(&self, task_id: Uuid) -> Result<Vec<AgentSession>>;

    async fn append_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()>;
    async fn list_retry_attempts(&self, task_id: Uuid) -> Result<Vec<RetryAttempt>>;
    async fn append_validation_run(&self, run: &ValidationRun) -> Result<()>;
    async fn list_validation_runs(&self, task_id: Uuid) -> Result<Vec<ValidationRun>>;

    async fn status_counts(&self) -> Result<StatusCounts>;
}

/// Short structured success/error records for the learning store.
#[async_trait]
pub trait PatternMemory: Send + Sync {
    async fn record_pattern(&self, record: &PatternRecord) -> Result<()>;
    /// Newest first; `None` returns both outcomes.
    async fn recent_patterns(
        &self,
        outcome: Option<PatternOutcome>,
        limit: usize,
    ) -> Result<Vec<PatternRecord>>;
}

// ---------------------------------------------------------------------------
// helpers: values <-> SQLite text
// ---------------------------------------------------------------------------

fn enum_to_sql<T: Serialize>(val: &T) -> Result<String> {
    match serde_json::to_value(val) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::Encode(format!("expected string enum, got {other}"))),
        Err(e) => Err(StoreError::Encode(e.to_string())),
    }
}

fn json_to_sql<T: Serialize>(val: &T) -> Result<String> {
    serde_json::to_string(val).map_err(|e| StoreError::Encode(e.to_string()))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn enum_col<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|e| conversion_error(idx, e))
}

fn opt_enum_col<T: DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_value(serde_json::Value::String(s)))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

fn json_col<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_col<T: DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

fn uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

/// Encoded task row, built outside the connection thread.
struct TaskRow {
    id: String,
    display_id: String,
    title: String,
    category: String,
    status: String,
    priority: String,
    effort: String,
    file_impacts: String,
    pass_criteria: String,
    sub_steps: String,
    task_list_id: String,
    last_error: Option<String>,
    agent_type: Option<String>,
    validation_level: Option<String>,
    budget_secs: Option<i64>,
    current_session_id: Option<String>,
    sequence: i64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn encode(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id.to_string(),
            display_id: task.display_id.clone(),
            title: task.title.clone(),
            category: enum_to_sql(&task.category)?,
            status: enum_to_sql(&task.status)?,
            priority: enum_to_sql(&task.priority)?,
            effort: enum_to_sql(&task.effort)?,
            file_impacts: json_to_sql(&task.file_impacts)?,
            pass_criteria: json_to_sql(&task.pass_criteria)?,
            sub_steps: json_to_sql(&task.sub_steps)?,
            task_list_id: task.task_list_id.to_string(),
            last_error: task.last_error.clone(),
            agent_type: task.agent_type.clone(),
            validation_level: task.validation_level.as_ref().map(enum_to_sql).transpose()?,
            budget_secs: task.budget_secs.map(|b| b as i64),
            current_session_id: task.current_session_id.map(|u| u.to_string()),
            sequence: task.sequence as i64,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
            started_at: task.started_at.map(|d| d.to_rfc3339()),
            completed_at: task.completed_at.map(|d| d.to_rfc3339()),
        })
    }

    fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, display_id, title, category, status, priority, effort,
                file_impacts, pass_criteria, sub_steps, task_list_id, last_error, agent_type,
                validation_level, budget_secs, current_session_id, sequence, created_at,
                updated_at, started_at, completed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            rusqlite::params![
                self.id,
                self.display_id,
                self.title,
                self.category,
                self.status,
                self.priority,
                self.effort,
                self.file_impacts,
                self.pass_criteria,
                self.sub_steps,
                self.task_list_id,
                self.last_error,
                self.agent_type,
                self.validation_level,
                self.budget_secs,
                self.current_session_id,
                self.sequence,
                self.created_at,
                self.updated_at,
                self.started_at,
                self.completed_at,
            ],
        )?;
        Ok(())
    }
}

const TASK_COLUMNS: &str = "t.id, t.display_id, t.title, t.category, t.status, t.priority,
    t.effort, t.file_impacts, t.pass_criteria, t.sub_steps, t.task_list_id, t.last_error,
    t.agent_type, t.validation_level, t.budget_secs, t.current_session_id, t.sequence,
    t.created_at, t.updated_at, t.started_at, t.completed_at,
    (SELECT COUNT(*) FROM retry_attempts r WHERE r.task_id = t.id)";

enum UpdateOutcome {
    Applied,
    NotFound,
    Rejected(TaskStatus),
}

enum EdgeOutcome {
    Inserted,
    MissingTask(Uuid),
    Cycle(Vec<String>),
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed Task Graph Store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                 TEXT PRIMARY KEY,
                        display_id         TEXT NOT NULL,
                        title              TEXT NOT NULL,
                        category           TEXT NOT NULL,
                        status             TEXT NOT NULL,
                        priority           TEXT NOT NULL,
                        effort             TEXT NOT NULL,
                        file_impacts       TEXT NOT NULL,
                        pass_criteria      TEXT NOT NULL,
                        sub_steps          TEXT NOT NULL,
                        task_list_id       TEXT NOT NULL,
                        last_error         TEXT,
                        agent_type         TEXT,
                        validation_level   TEXT,
                        budget_secs        INTEGER,
                        current_session_id TEXT,
                        sequence           INTEGER NOT NULL,
                        created_at         TEXT NOT NULL,
                        updated_at         TEXT NOT NULL,
                        started_at         TEXT,
                        completed_at       TEXT,
                        UNIQUE (task_list_id, display_id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status  ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_display ON tasks(display_id);

                    CREATE TABLE IF NOT EXISTS relationships (
                        id         TEXT PRIMARY KEY,
                        from_task  TEXT NOT NULL REFERENCES tasks(id),
                        to_task    TEXT NOT NULL REFERENCES tasks(id),
                        kind       TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agent_sessions (
                        id           TEXT PRIMARY KEY,
                        task_id      TEXT NOT NULL REFERENCES tasks(id),
                        agent_type   TEXT NOT NULL,
                        started_at   TEXT NOT NULL,
                        heartbeat_at TEXT,
                        ended_at     TEXT,
                        status       TEXT NOT NULL,
                        exit_code    INTEGER,
                        output       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_sessions_task ON agent_sessions(task_id);

                    CREATE TABLE IF NOT EXISTS retry_attempts (
                        id         TEXT PRIMARY KEY,
                        task_id    TEXT NOT NULL REFERENCES tasks(id),
                        session_id TEXT,
                        attempt    INTEGER NOT NULL,
                        error_kind TEXT NOT NULL,
                        decision   TEXT NOT NULL,
                        backoff_ms INTEGER NOT NULL,
                        feedback   TEXT,
                        reason     TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        UNIQUE (task_id, attempt)
                    );

                    CREATE TABLE IF NOT EXISTS validation_runs (
                        id          TEXT PRIMARY KEY,
                        task_id     TEXT NOT NULL REFERENCES tasks(id),
                        session_id  TEXT,
                        level       TEXT NOT NULL,
                        checks      TEXT NOT NULL,
                        passed      INTEGER NOT NULL,
                        started_at  TEXT NOT NULL,
                        finished_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_validation_task ON validation_runs(task_id);

                    CREATE TABLE IF NOT EXISTS patterns (
                        id         TEXT PRIMARY KEY,
                        task_id    TEXT NOT NULL,
                        outcome    TEXT NOT NULL,
                        error_kind TEXT,
                        signature  TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_tasks(&self, filter: &'static str, arg: Option<String>) -> Result<Vec<Task>> {
        let tasks = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t {filter}");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = match &arg {
                    Some(a) => stmt.query(rusqlite::params![a])?,
                    None => stmt.query([])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }
}

#[async_trait]
impl TaskGraphStore for SqliteStore {
    async fn insert_graph(&self, tasks: &[Task], relationships: &[TaskRelationship]) -> Result<()> {
        let rows = tasks.iter().map(TaskRow::encode).collect::<Result<Vec<_>>>()?;
        let edges = relationships
            .iter()
            .map(|r| {
                Ok((
                    r.id.to_string(),
                    r.from_task.to_string(),
                    r.to_task.to_string(),
                    enum_to_sql(&r.kind)?,
                    r.created_at.to_rfc3339(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let task_count = rows.len();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for row in &rows {
                    row.insert(&tx)?;
                }
                for (id, from, to, kind, created_at) in &edges {
                    tx.execute(
                        "INSERT INTO relationships (id, from_task, to_task, kind, created_at)
                         VALUES (?1,?2,?3,?4,?5)",
                        rusqlite::params![id, from, to, kind, created_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::debug!(tasks = task_count, "task graph persisted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let mut tasks = self
            .query_tasks("WHERE t.id = ?1", Some(id.to_string()))
            .await?;
        Ok(tasks.pop())
    }

    async fn get_task_by_display_id(&self, display_id: &str) -> Result<Option<Task>> {
        let mut tasks = self
            .query_tasks(
                "WHERE t.display_id = ?1 ORDER BY t.created_at DESC, t.sequence DESC LIMIT 1",
                Some(display_id.to_string()),
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks("ORDER BY t.sequence ASC, t.created_at ASC", None)
            .await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.query_tasks(
            "WHERE t.status = ?1 ORDER BY t.sequence ASC",
            Some(enum_to_sql(&status)?),
        )
        .await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let row = TaskRow::encode(task)?;
        let target = task.status;
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE id = ?1",
                        rusqlite::params![row.id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(current) = current else {
                    return Ok(UpdateOutcome::NotFound);
                };
                let current: TaskStatus =
                    serde_json::from_value(serde_json::Value::String(current))
                        .map_err(|e| conversion_error(0, e))?;
                if current != target && !current.can_transition_to(&target) {
                    return Ok(UpdateOutcome::Rejected(current));
                }
                tx.execute(
                    "UPDATE tasks SET title=?2, category=?3, status=?4, priority=?5, effort=?6,
                        file_impacts=?7, pass_criteria=?8, sub_steps=?9, last_error=?10,
                        agent_type=?11, validation_level=?12, budget_secs=?13,
                        current_session_id=?14, updated_at=?15, started_at=?16,
                        completed_at=?17
                     WHERE id = ?1",
                    rusqlite::params![
                        row.id,
                        row.title,
                        row.category,
                        row.status,
                        row.priority,
                        row.effort,
                        row.file_impacts,
                        row.pass_criteria,
                        row.sub_steps,
                        row.last_error,
                        row.agent_type,
                        row.validation_level,
                        row.budget_secs,
                        row.current_session_id,
                        row.updated_at,
                        row.started_at,
                        row.completed_at,
                    ],
                )?;
                tx.commit()?;
                Ok(UpdateOutcome::Applied)
            })
            .await?;

        match outcome {
            UpdateOutcome::Applied => Ok(()),
            UpdateOutcome::NotFound => Err(StoreError::TaskNotFound(task.id)),
            UpdateOutcome::Rejected(from) => Err(StoreError::InvalidTransition {
                task_id: task.id,
                from,
                to: target,
            }),
        }
    }

    async fn list_relationships(&self) -> Result<Vec<TaskRelationship>> {
        let rels = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, from_task, to_task, kind, created_at
                     FROM relationships ORDER BY created_at ASC, rowid ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_relationship(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rels)
    }

    async fn insert_relationship(&self, rel: &TaskRelationship) -> Result<()> {
        if rel.from_task == rel.to_task {
            return Err(GraphError::SelfReference(rel.from_task.to_string()).into());
        }
        let rel = rel.clone();
        let kind = enum_to_sql(&rel.kind)?;
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in [rel.from_task, rel.to_task] {
                    let exists: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM tasks WHERE id = ?1",
                        rusqlite::params![id.to_string()],
                        |r| r.get(0),
                    )?;
                    if exists == 0 {
                        return Ok(EdgeOutcome::MissingTask(id));
                    }
                }

                if let Some((waiter, prereq)) = rel.as_dependency() {
                    let mut stmt = tx.prepare(
                        "SELECT id, from_task, to_task, kind, created_at FROM relationships",
                    )?;
                    let mut rows = stmt.query([])?;
                    let mut existing = Vec::new();
                    while let Some(row) = rows.next()? {
                        existing.push(row_to_relationship(row)?);
                    }
                    drop(rows);
                    drop(stmt);
                    let index = DependencyIndex::from_relationships(&existing);
                    if let Some(cycle) = index.cycle_with(waiter, prereq) {
                        let mut names = Vec::with_capacity(cycle.len());
                        for id in cycle {
                            let name: String = tx
                                .query_row(
                                    "SELECT display_id FROM tasks WHERE id = ?1",
                                    rusqlite::params![id.to_string()],
                                    |r| r.get(0),
                                )
                                .unwrap_or_else(|_| id.to_string());
                            names.push(name);
                        }
                        return Ok(EdgeOutcome::Cycle(names));
                    }
                }

                tx.execute(
                    "INSERT INTO relationships (id, from_task, to_task, kind, created_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        rel.id.to_string(),
                        rel.from_task.to_string(),
                        rel.to_task.to_string(),
                        kind,
                        rel.created_at.to_rfc3339(),
                    ],
                )?;
                tx.commit()?;
                Ok(EdgeOutcome::Inserted)
            })
            .await?;

        match outcome {
            EdgeOutcome::Inserted => Ok(()),
            EdgeOutcome::MissingTask(id) => Err(StoreError::TaskNotFound(id)),
            EdgeOutcome::Cycle(path) => Err(GraphError::Cycle { path }.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    async fn upsert_session(&self, session: &AgentSession) -> Result<()> {
        let id = session.id.to_string();
        let task_id = session.task_id.to_string();
        let agent_type = session.agent_type.clone();
        let started_at = session.started_at.to_rfc3339();
        let heartbeat_at = session.heartbeat_at.map(|d| d.to_rfc3339());
        let ended_at = session.ended_at.map(|d| d.to_rfc3339());
        let status = enum_to_sql(&session.status)?;
        let exit_code = session.exit_code;
        let output = session.output.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_sessions (id, task_id, agent_type, started_at,
                        heartbeat_at, ended_at, status, exit_code, output)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        heartbeat_at=excluded.heartbeat_at, ended_at=excluded.ended_at,
                        status=excluded.status, exit_code=excluded.exit_code,
                        output=excluded.output",
                    rusqlite::params![
                        id, task_id, agent_type, started_at, heartbeat_at, ended_at, status,
                        exit_code, output,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<AgentSession>> {
        let id = id.to_string();
        let session = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, agent_type, started_at, heartbeat_at, ended_at,
                            status, exit_code, output
                     FROM agent_sessions WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(session)
    }

    async fn list_sessions_for_task(&self, task_id: Uuid) -> Result<Vec<AgentSession>> {
        let task_id = task_id.to_string();
        let sessions = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, agent_type, started_at, heartbeat_at, ended_at,
                            status, exit_code, output
                     FROM agent_sessions WHERE task_id = ?1
                     ORDER BY started_at ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_session(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(sessions)
    }

    // -----------------------------------------------------------------------
    // Append-only logs
    // -----------------------------------------------------------------------

    async fn append_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let id = attempt.id.to_string();
        let task_id = attempt.task_id.to_string();
        let session_id = attempt.session_id.map(|u| u.to_string());
        let number = attempt.attempt;
        let kind = enum_to_sql(&attempt.error_kind)?;
        let decision = enum_to_sql(&attempt.decision)?;
        let backoff_ms = attempt.backoff_ms as i64;
        let feedback = attempt.feedback.as_ref().map(json_to_sql).transpose()?;
        let reason = attempt.reason.clone();
        let created_at = attempt.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO retry_attempts (id, task_id, session_id, attempt, error_kind,
                        decision, backoff_ms, feedback, reason, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        id, task_id, session_id, number, kind, decision, backoff_ms, feedback,
                        reason, created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_retry_attempts(&self, task_id: Uuid) -> Result<Vec<RetryAttempt>> {
        let task_id = task_id.to_string();
        let attempts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, session_id, attempt, error_kind, decision,
                            backoff_ms, feedback, reason, created_at
                     FROM retry_attempts WHERE task_id = ?1 ORDER BY attempt ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_retry_attempt(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(attempts)
    }

    async fn append_validation_run(&self, run: &ValidationRun) -> Result<()> {
        let id = run.id.to_string();
        let task_id = run.task_id.to_string();
        let session_id = run.session_id.map(|u| u.to_string());
        let level = enum_to_sql(&run.level)?;
        let checks = json_to_sql(&run.checks)?;
        let passed = run.passed;
        let started_at = run.started_at.to_rfc3339();
        let finished_at = run.finished_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO validation_runs (id, task_id, session_id, level, checks,
                        passed, started_at, finished_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        id, task_id, session_id, level, checks, passed, started_at, finished_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_validation_runs(&self, task_id: Uuid) -> Result<Vec<ValidationRun>> {
        let task_id = task_id.to_string();
        let runs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, session_id, level, checks, passed, started_at,
                            finished_at
                     FROM validation_runs WHERE task_id = ?1
                     ORDER BY started_at ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_validation_run(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(runs)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let pairs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let status: TaskStatus = enum_col(row, 0)?;
                    let n: i64 = row.get(1)?;
                    out.push((status, n as u64));
                }
                Ok(out)
            })
            .await?;
        let mut counts = StatusCounts::default();
        for (status, n) in pairs {
            counts.add(status, n);
        }
        Ok(counts)
    }
}

#[async_trait]
impl PatternMemory for SqliteStore {
    async fn record_pattern(&self, record: &PatternRecord) -> Result<()> {
        let id = record.id.to_string();
        let task_id = record.task_id.to_string();
        let outcome = enum_to_sql(&record.outcome)?;
        let error_kind = record.error_kind.as_ref().map(enum_to_sql).transpose()?;
        let signature = record.signature.clone();
        let created_at = record.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO patterns (id, task_id, outcome, error_kind, signature, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![id, task_id, outcome, error_kind, signature, created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn recent_patterns(
        &self,
        outcome: Option<PatternOutcome>,
        limit: usize,
    ) -> Result<Vec<PatternRecord>> {
        let outcome = outcome.as_ref().map(enum_to_sql).transpose()?;
        let limit = limit as i64;
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, outcome, error_kind, signature, created_at
                     FROM patterns WHERE (?1 IS NULL OR outcome = ?1)
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![outcome, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(PatternRecord {
                        id: uuid_col(row, 0)?,
                        task_id: uuid_col(row, 1)?,
                        outcome: enum_col(row, 2)?,
                        error_kind: opt_enum_col(row, 3)?,
                        signature: row.get(4)?,
                        created_at: time_col(row, 5)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let budget: Option<i64> = row.get(14)?;
    let sequence: i64 = row.get(16)?;
    let retries: i64 = row.get(21)?;
    Ok(Task {
        id: uuid_col(row, 0)?,
        display_id: row.get(1)?,
        title: row.get(2)?,
        category: enum_col(row, 3)?,
        status: enum_col(row, 4)?,
        priority: enum_col(row, 5)?,
        effort: enum_col(row, 6)?,
        file_impacts: json_col(row, 7)?,
        pass_criteria: json_col(row, 8)?,
        sub_steps: json_col(row, 9)?,
        task_list_id: uuid_col(row, 10)?,
        retry_count: retries as u32,
        last_error: row.get(11)?,
        agent_type: row.get(12)?,
        validation_level: opt_enum_col(row, 13)?,
        budget_secs: budget.map(|b| b as u64),
        current_session_id: opt_uuid_col(row, 15)?,
        sequence: sequence as u64,
        created_at: time_col(row, 17)?,
        updated_at: time_col(row, 18)?,
        started_at: opt_time_col(row, 19)?,
        completed_at: opt_time_col(row, 20)?,
    })
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRelationship> {
    Ok(TaskRelationship {
        id: uuid_col(row, 0)?,
        from_task: uuid_col(row, 1)?,
        to_task: uuid_col(row, 2)?,
        kind: enum_col(row, 3)?,
        created_at: time_col(row, 4)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentSession> {
    Ok(AgentSession {
        id: uuid_col(row, 0)?,
        task_id: uuid_col(row, 1)?,
        agent_type: row.get(2)?,
        started_at: time_col(row, 3)?,
        heartbeat_at: opt_time_col(row, 4)?,
        ended_at: opt_time_col(row, 5)?,
        status: enum_col(row, 6)?,
        exit_code: row.get(7)?,
        output: row.get(8)?,
    })
}

fn row_to_retry_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetryAttempt> {
    let backoff: i64 = row.get(6)?;
    Ok(RetryAttempt {
        id: uuid_col(row, 0)?,
        task_id: uuid_col(row, 1)?,
        session_id: opt_uuid_col(row, 2)?,
        attempt: row.get(3)?,
        error_kind: enum_col(row, 4)?,
        decision: enum_col(row, 5)?,
        backoff_ms: backoff as u64,
        feedback: opt_json_col(row, 7)?,
        reason: row.get(8)?,
        created_at: time_col(row, 9)?,
    })
}

fn row_to_validation_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationRun> {
    Ok(ValidationRun {
        id: uuid_col(row, 0)?,
        task_id: uuid_col(row, 1)?,
        session_id: opt_uuid_col(row, 2)?,
        level: enum_col(row, 3)?,
        checks: json_col(row, 4)?,
        passed: row.get(5)?,
        started_at: time_col(row, 6)?,
        finished_at: time_col(row, 7)?,
    })
}
