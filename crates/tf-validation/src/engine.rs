use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tf_core::config::ValidationConfig;
use tf_core::store::{StoreError, TaskGraphStore};
use tf_core::types::{
    CheckResult, CheckRun, Expectation, FileOperation, Task, ValidationLevel, ValidationRun,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::checks::{
    excerpt, expand_files, CheckExecutor, PlannedCheck, ProcessCheckExecutor, EXCERPT_BYTES,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("failed to record validation run: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Default level for criterion checks that do not name one.
pub const CRITERION_LEVEL: ValidationLevel = ValidationLevel::Thorough;

/// Level of the existence checks derived from declared create/delete impacts.
pub const ARTIFACT_LEVEL: ValidationLevel = ValidationLevel::Thorough;

// ---------------------------------------------------------------------------
// ValidationEngine
// ---------------------------------------------------------------------------

/// Runs the checks of a validation level against a task's output.
///
/// Levels are cumulative: the checks run at level `L` are every configured
/// or criterion check whose level is at most `L`. Checks may execute
/// concurrently, but results are always reported in declared order.
#[derive(Clone)]
pub struct ValidationEngine {
    config: ValidationConfig,
    executor: Arc<dyn CheckExecutor>,
    workdir: PathBuf,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            executor: Arc::new(ProcessCheckExecutor::new()),
            workdir: workdir.into(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CheckExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Level for `task`: explicit override, else its priority mapping, never
    /// below the configured minimum.
    pub fn select_level(&self, task: &Task) -> ValidationLevel {
        task.validation_level
            .unwrap_or_else(|| ValidationLevel::for_priority(task.priority))
            .max(self.config.minimum_level)
    }

    /// Resolve the ordered check list for `task` at `level`.
    pub fn plan(&self, task: &Task, level: ValidationLevel) -> Vec<PlannedCheck> {
        let files = task.written_paths();
        let default_timeout = Duration::from_secs(self.config.check_timeout_secs);

        let configured = self.config.checks.iter().map(|def| PlannedCheck {
            name: def.name.clone(),
            description: def.description.clone(),
            level: def.level,
            run: expand_files(&def.run, &files),
            expect: def.expect.clone(),
            timeout: def
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        });
        let artifacts = task.file_impacts.iter().filter_map(|impact| {
            let (name, run) = match impact.operation {
                FileOperation::Create => (
                    format!("exists:{}", impact.path),
                    CheckRun::FileExists {
                        path: impact.path.clone(),
                    },
                ),
                FileOperation::Delete => (
                    format!("absent:{}", impact.path),
                    CheckRun::FileAbsent {
                        path: impact.path.clone(),
                    },
                ),
                FileOperation::Update | FileOperation::Read => return None,
            };
            Some(PlannedCheck {
                name,
                description: String::new(),
                level: ARTIFACT_LEVEL,
                run,
                expect: Expectation::Success,
                timeout: default_timeout,
            })
        });
        let criteria = task
            .pass_criteria
            .iter()
            .filter_map(|c| c.check.as_ref().map(|run| (c, run)))
            .enumerate()
            .map(|(i, (criterion, run))| PlannedCheck {
                name: format!("criterion-{}", i + 1),
                description: criterion.description.clone(),
                level: criterion.level.unwrap_or(CRITERION_LEVEL),
                run: expand_files(run, &files),
                expect: criterion.expect.clone(),
                timeout: default_timeout,
            });

        let mut planned: Vec<PlannedCheck> = configured
            .chain(artifacts)
            .chain(criteria)
            .filter(|c| c.level <= level)
            .collect();
        // Stable: declaration order is kept within a level.
        planned.sort_by_key(|c| c.level);
        planned
    }

    /// Run every check of `level` and produce the run record.
    pub async fn validate(
        &self,
        task: &Task,
        level: ValidationLevel,
        session_id: Option<Uuid>,
    ) -> ValidationRun {
        let started_at = Utc::now();
        let planned = self.plan(task, level);
        tracing::info!(
            task_id = %task.id,
            display_id = %task.display_id,
            level = %level,
            checks = planned.len(),
            "validation started"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_parallel_checks.max(1)));
        let runs = planned.into_iter().map(|check| {
            let permits = Arc::clone(&permits);
            let executor = Arc::clone(&self.executor);
            let workdir = self.workdir.clone();
            async move {
                let _permit = permits.acquire_owned().await.ok();
                run_check(executor.as_ref(), check, &workdir).await
            }
        });
        // join_all yields results in input order regardless of completion order.
        let checks: Vec<CheckResult> = futures::future::join_all(runs).await;

        let passed = checks.iter().all(|c| c.passed);
        let run = ValidationRun {
            id: Uuid::new_v4(),
            task_id: task.id,
            session_id,
            level,
            checks,
            passed,
            started_at,
            finished_at: Utc::now(),
        };
        if passed {
            tracing::info!(task_id = %task.id, level = %level, "validation passed");
        } else {
            let failing: Vec<&str> = run.failing_checks().map(|c| c.name.as_str()).collect();
            tracing::warn!(task_id = %task.id, level = %level, failing = ?failing, "validation failed");
        }
        run
    }

    /// [`validate`](Self::validate) and append the run to the store.
    pub async fn validate_and_record(
        &self,
        store: &dyn TaskGraphStore,
        task: &Task,
        level: ValidationLevel,
        session_id: Option<Uuid>,
    ) -> Result<ValidationRun> {
        let run = self.validate(task, level, session_id).await;
        store.append_validation_run(&run).await?;
        Ok(run)
    }
}

async fn run_check(executor: &dyn CheckExecutor, check: PlannedCheck, workdir: &Path) -> CheckResult {
    let start = Instant::now();
    let outcome = tokio::time::timeout(check.timeout, executor.execute(&check, workdir)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (passed, timed_out, output) = match outcome {
        Ok(out) => (out.passed, false, out.output),
        Err(_) => {
            tracing::warn!(check = %check.name, timeout_secs = check.timeout.as_secs(), "check timed out");
            (
                false,
                true,
                format!("timed out after {}s", check.timeout.as_secs()),
            )
        }
    };
    CheckResult {
        description: check.render(),
        name: check.name,
        level: check.level,
        passed,
        timed_out,
        output_excerpt: excerpt(&output, EXCERPT_BYTES),
        duration_ms,
    }
}
