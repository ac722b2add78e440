use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Skipped,
    ];

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Forward-only, except for the retry loop (`Failed -> Pending`) and a
    /// manual resume of an escalated task (`Blocked -> Pending`).
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Skipped)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Skipped)
                | (TaskStatus::Failed, TaskStatus::Pending)
                | (TaskStatus::Failed, TaskStatus::Skipped)
                | (TaskStatus::Blocked, TaskStatus::Pending)
                | (TaskStatus::Blocked, TaskStatus::Skipped)
        )
    }

    /// Completed and skipped tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Category / priority / effort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    Infrastructure,
    Other,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Trivial,
    #[default]
    Small,
    Medium,
    Large,
    #[serde(rename = "xlarge")]
    XLarge,
}

impl Effort {
    /// Multiplier applied to the minimum execution budget.
    pub fn budget_factor(&self) -> f64 {
        match self {
            Effort::Trivial => 1.0,
            Effort::Small => 1.25,
            Effort::Medium => 1.5,
            Effort::Large => 2.5,
            Effort::XLarge => 3.0,
        }
    }
}

// ---------------------------------------------------------------------------
// File impacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
    Read,
}

impl FileOperation {
    /// Conflict matrix for two operations on the same path.
    ///
    /// Any pairing with `Read` is safe; every pairing of two writes
    /// (create, update, delete) serializes.
    pub fn conflicts_with(&self, other: &FileOperation) -> bool {
        !matches!(self, FileOperation::Read) && !matches!(other, FileOperation::Read)
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, FileOperation::Read)
    }
}

fn default_confidence() -> f32 {
    1.0
}

/// A declared `(path, operation)` pair a task intends to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileImpact {
    pub path: String,
    pub operation: FileOperation,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

impl FileImpact {
    pub fn new(path: impl Into<String>, operation: FileOperation) -> Self {
        Self {
            path: normalize_path(&path.into()),
            operation,
            confidence: 1.0,
        }
    }

    /// Returns `true` when both impacts touch the same normalised path with
    /// a conflicting pair of operations.
    pub fn conflicts_with(&self, other: &FileImpact) -> bool {
        self.operation.conflicts_with(&other.operation)
            && normalize_path(&self.path) == normalize_path(&other.path)
    }
}

/// Normalise a relative path for conflict comparison: `\` becomes `/`,
/// leading `./` segments and duplicate separators are removed.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();
    let joined = parts.join("/");
    if unified.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

// ---------------------------------------------------------------------------
// Checks (shared by pass criteria and validation configuration)
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Quick = 0,
    #[default]
    Standard = 1,
    Thorough = 2,
    Release = 3,
}

impl ValidationLevel {
    pub const ALL: [ValidationLevel; 4] = [
        ValidationLevel::Quick,
        ValidationLevel::Standard,
        ValidationLevel::Thorough,
        ValidationLevel::Release,
    ];

    /// Default level for a task of the given priority.
    pub fn for_priority(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::Low => ValidationLevel::Quick,
            TaskPriority::Medium => ValidationLevel::Standard,
            TaskPriority::High => ValidationLevel::Thorough,
            TaskPriority::Critical => ValidationLevel::Release,
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValidationLevel::Quick => "quick",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Thorough => "thorough",
            ValidationLevel::Release => "release",
        };
        f.write_str(label)
    }
}

/// What a check actually does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckRun {
    /// Run a program; `{files}` in an argument expands to the task's
    /// written paths.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    FileExists {
        path: String,
    },
    FileAbsent {
        path: String,
    },
    FileContains {
        path: String,
        needle: String,
    },
}

/// The outcome a check must produce to pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    #[default]
    Success,
    Failure,
    ExitCode {
        code: i32,
    },
    OutputContains {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Lowest validation level this check belongs to.
    #[serde(default)]
    pub level: ValidationLevel,
    pub run: CheckRun,
    #[serde(default)]
    pub expect: Expectation,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Human-readable acceptance criterion, optionally machine-checkable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCriterion {
    pub description: String,
    #[serde(default)]
    pub check: Option<CheckRun>,
    #[serde(default)]
    pub expect: Expectation,
    #[serde(default)]
    pub level: Option<ValidationLevel>,
}

impl PassCriterion {
    pub fn manual(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            check: None,
            expect: Expectation::Success,
            level: None,
        }
    }

    pub fn checked(description: impl Into<String>, check: CheckRun) -> Self {
        Self {
            description: description.into(),
            check: Some(check),
            expect: Expectation::Success,
            level: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub display_id: String,
    pub title: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub effort: Effort,
    pub file_impacts: Vec<FileImpact>,
    pub pass_criteria: Vec<PassCriterion>,
    pub sub_steps: Vec<String>,
    pub task_list_id: Uuid,
    /// Always equal to the number of retry attempts recorded for this task.
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub agent_type: Option<String>,
    pub validation_level: Option<ValidationLevel>,
    pub budget_secs: Option<u64>,
    /// Latest agent session, by id only.
    pub current_session_id: Option<Uuid>,
    /// Input order; the creation-order tie-break for scheduling.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(display_id: impl Into<String>, title: impl Into<String>, task_list_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_id: display_id.into(),
            title: title.into(),
            category: TaskCategory::default(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            effort: Effort::default(),
            file_impacts: Vec::new(),
            pass_criteria: Vec::new(),
            sub_steps: Vec::new(),
            task_list_id,
            retry_count: 0,
            last_error: None,
            agent_type: None,
            validation_level: None,
            budget_secs: None,
            current_session_id: None,
            sequence: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Paths this task writes (create, update, delete), normalised.
    pub fn written_paths(&self) -> Vec<String> {
        self.file_impacts
            .iter()
            .filter(|fi| fi.operation.is_write())
            .map(|fi| normalize_path(&fi.path))
            .collect()
    }

    /// Returns `true` when any pair of file impacts conflicts.
    pub fn conflicts_on_files(&self, other: &Task) -> bool {
        self.file_impacts
            .iter()
            .any(|a| other.file_impacts.iter().any(|b| a.conflicts_with(b)))
    }

    /// Apply a status change, stamping the relevant timestamps.
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        if status == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// TaskRelationship
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    DependsOn,
    Blocks,
    ConflictsWith,
    RelatedTo,
    DuplicateOf,
    SubtaskOf,
}

impl RelationshipKind {
    pub fn affects_scheduling(&self) -> bool {
        matches!(
            self,
            RelationshipKind::DependsOn | RelationshipKind::Blocks | RelationshipKind::ConflictsWith
        )
    }

    /// Edges that order execution and therefore must stay acyclic.
    pub fn is_ordering(&self) -> bool {
        matches!(self, RelationshipKind::DependsOn | RelationshipKind::Blocks)
    }
}

/// Directed edge `from_task -> to_task`.
///
/// `A depends_on B` means A waits for B; `A blocks B` means B waits for A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRelationship {
    pub id: Uuid,
    pub from_task: Uuid,
    pub to_task: Uuid,
    pub kind: RelationshipKind,
    pub created_at: DateTime<Utc>,
}

impl TaskRelationship {
    pub fn new(from_task: Uuid, to_task: Uuid, kind: RelationshipKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_task,
            to_task,
            kind,
            created_at: Utc::now(),
        }
    }

    /// Normalise an ordering edge to `(waiting task, prerequisite)`.
    pub fn as_dependency(&self) -> Option<(Uuid, Uuid)> {
        match self.kind {
            RelationshipKind::DependsOn => Some((self.from_task, self.to_task)),
            RelationshipKind::Blocks => Some((self.to_task, self.from_task)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Completed,
    Failed,
    TimedOut,
    Killed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Killed => "killed",
        };
        f.write_str(label)
    }
}

/// One supervised execution attempt of a worker for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_type: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    /// Captured stdout/stderr tail.
    pub output: String,
}

impl AgentSession {
    pub fn new(task_id: Uuid, agent_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            agent_type: agent_type.into(),
            started_at: Utc::now(),
            heartbeat_at: None,
            ended_at: None,
            status: SessionStatus::Starting,
            exit_code: None,
            output: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Orchestration-level error classes, as they appear in logs and reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    GraphError,
    SpawnError,
    ExecutionFailure,
    ExecutionTimeout,
    ValidationFailure,
    SchedulingStall,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureClass::GraphError => "graph_error",
            FailureClass::SpawnError => "spawn_error",
            FailureClass::ExecutionFailure => "execution_failure",
            FailureClass::ExecutionTimeout => "execution_timeout",
            FailureClass::ValidationFailure => "validation_failure",
            FailureClass::SchedulingStall => "scheduling_stall",
        };
        f.write_str(label)
    }
}

/// Retry classification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientInfra,
    ValidationFailure,
    StructuralError,
    ExecutionTimeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::TransientInfra => "transient_infra",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::StructuralError => "structural_error",
            ErrorKind::ExecutionTimeout => "execution_timeout",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Retry,
    Escalate,
    Abort,
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetryDecision::Retry => "retry",
            RetryDecision::Escalate => "escalate",
            RetryDecision::Abort => "abort",
        };
        f.write_str(label)
    }
}

/// One failing check (or failure excerpt) handed back to the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub name: String,
    pub output: String,
}

/// Feedback payload for the next worker attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryFeedback {
    pub summary: String,
    #[serde(default)]
    pub failures: Vec<FailureDetail>,
    #[serde(default)]
    pub reduced_scope_hint: Option<String>,
}

impl RetryFeedback {
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.failures.is_empty() && self.reduced_scope_hint.is_none()
    }
}

/// One retry decision; append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    pub session_id: Option<Uuid>,
    pub attempt: u32,
    pub error_kind: ErrorKind,
    pub decision: RetryDecision,
    pub backoff_ms: u64,
    pub feedback: Option<RetryFeedback>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ValidationRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    /// Command line or description of what was checked.
    pub description: String,
    pub level: ValidationLevel,
    pub passed: bool,
    pub timed_out: bool,
    pub output_excerpt: String,
    pub duration_ms: u64,
}

/// One execution of the validation engine against a task; append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub session_id: Option<Uuid>,
    pub level: ValidationLevel,
    pub checks: Vec<CheckResult>,
    pub passed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ValidationRun {
    pub fn failing_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

// ---------------------------------------------------------------------------
// Pattern memory records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOutcome {
    Success,
    Error,
}

/// Short structured record for the learning store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub outcome: PatternOutcome,
    pub error_kind: Option<ErrorKind>,
    /// First meaningful line of the failure, or the task title on success.
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StatusCounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub blocked: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.blocked + self.skipped
    }

    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::InProgress => self.in_progress += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Blocked => self.blocked += n,
            TaskStatus::Skipped => self.skipped += n,
        }
    }
}
