use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tf_core::config::ValidationConfig;
use tf_core::memory_store::MemoryStore;
use tf_core::store::TaskGraphStore;
use tf_core::types::{
    CheckDefinition, CheckRun, Expectation, FileImpact, FileOperation, PassCriterion, Task,
    TaskPriority, ValidationLevel,
};
use tf_validation::checks::{CheckExecutor, CheckOutput, PlannedCheck};
use tf_validation::engine::ValidationEngine;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn command(name: &str, level: ValidationLevel, script: &str) -> CheckDefinition {
    CheckDefinition {
        name: name.into(),
        description: String::new(),
        level,
        run: CheckRun::Command {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        },
        expect: Expectation::Success,
        timeout_secs: None,
    }
}

fn config(checks: Vec<CheckDefinition>) -> ValidationConfig {
    ValidationConfig {
        checks,
        ..ValidationConfig::default()
    }
}

fn task() -> Task {
    let mut t = Task::new("T4", "add parser", Uuid::new_v4());
    t.file_impacts = vec![
        FileImpact::new("src/parser.ts", FileOperation::Create),
        FileImpact::new("src/lexer.ts", FileOperation::Read),
    ];
    t
}

/// Scripted executor: each check sleeps for its delay, then passes unless
/// listed as failing. Records start order.
#[derive(Default)]
struct ScriptedChecks {
    delays: HashMap<String, Duration>,
    failing: Vec<String>,
    started: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CheckExecutor for ScriptedChecks {
    async fn execute(&self, check: &PlannedCheck, _workdir: &Path) -> CheckOutput {
        self.started.lock().unwrap().push(check.name.clone());
        if let Some(delay) = self.delays.get(&check.name) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&check.name) {
            CheckOutput::fail(format!("{} FAILED", check.name))
        } else {
            CheckOutput::pass("ok")
        }
    }
}

fn scripted(checks: Vec<CheckDefinition>, executor: ScriptedChecks) -> (ValidationEngine, Arc<ScriptedChecks>) {
    let executor = Arc::new(executor);
    let engine = ValidationEngine::new(config(checks), ".").with_executor(executor.clone());
    (engine, executor)
}

fn ladder() -> Vec<CheckDefinition> {
    vec![
        command("release-scan", ValidationLevel::Release, "true"),
        command("typecheck", ValidationLevel::Quick, "true"),
        command("unit", ValidationLevel::Standard, "true"),
        command("build", ValidationLevel::Standard, "true"),
        command("integration", ValidationLevel::Thorough, "true"),
    ]
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[test]
fn levels_are_cumulative_and_ordered() {
    let engine = ValidationEngine::new(config(ladder()), ".");
    let names = |level| -> Vec<String> {
        engine
            .plan(&task(), level)
            .into_iter()
            .map(|c| c.name)
            .collect()
    };

    assert_eq!(names(ValidationLevel::Quick), vec!["typecheck"]);
    assert_eq!(names(ValidationLevel::Standard), vec!["typecheck", "unit", "build"]);
    assert_eq!(
        names(ValidationLevel::Release),
        vec![
            "typecheck",
            "unit",
            "build",
            "integration",
            "exists:src/parser.ts",
            "release-scan"
        ]
    );

    // Every lower level is a prefix-preserving subset of the higher one.
    for pair in ValidationLevel::ALL.windows(2) {
        let lower = names(pair[0]);
        let higher = names(pair[1]);
        assert!(lower.iter().all(|n| higher.contains(n)));
    }
}

#[test]
fn criterion_checks_follow_configured_checks() {
    let mut t = task();
    t.pass_criteria = vec![
        PassCriterion::manual("reads well"),
        PassCriterion::checked(
            "parser file exists",
            CheckRun::FileExists {
                path: "src/parser.ts".into(),
            },
        ),
        PassCriterion {
            level: Some(ValidationLevel::Standard),
            ..PassCriterion::checked(
                "exports parse",
                CheckRun::FileContains {
                    path: "src/parser.ts".into(),
                    needle: "export function parse".into(),
                },
            )
        },
    ];
    let engine = ValidationEngine::new(config(ladder()), ".");

    let standard: Vec<_> = engine
        .plan(&t, ValidationLevel::Standard)
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(standard, vec!["typecheck", "unit", "build", "criterion-2"]);

    let thorough: Vec<_> = engine
        .plan(&t, ValidationLevel::Thorough)
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(
        thorough,
        vec![
            "typecheck",
            "unit",
            "build",
            "criterion-2",
            "integration",
            "exists:src/parser.ts",
            "criterion-1"
        ]
    );
}

#[test]
fn declared_artifacts_are_checked_at_thorough() {
    let mut t = task();
    t.file_impacts.push(FileImpact::new("src/old_parser.ts", FileOperation::Delete));
    t.file_impacts.push(FileImpact::new("src/ast.ts", FileOperation::Update));
    let engine = ValidationEngine::new(config(ladder()), ".");

    let standard = engine.plan(&t, ValidationLevel::Standard);
    assert!(standard.iter().all(|c| c.level <= ValidationLevel::Standard));
    assert!(!standard.iter().any(|c| c.name.starts_with("exists:")));

    let thorough = engine.plan(&t, ValidationLevel::Thorough);
    let artifacts: Vec<_> = thorough
        .iter()
        .filter(|c| c.name.starts_with("exists:") || c.name.starts_with("absent:"))
        .collect();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(
        artifacts[0].run,
        CheckRun::FileExists {
            path: "src/parser.ts".into()
        }
    );
    assert_eq!(
        artifacts[1].run,
        CheckRun::FileAbsent {
            path: "src/old_parser.ts".into()
        }
    );
    assert_eq!(artifacts[1].render(), "file absent: src/old_parser.ts");
    assert!(artifacts.iter().all(|c| c.level == ValidationLevel::Thorough));
}

#[test]
fn files_placeholder_targets_written_paths() {
    let unit = CheckDefinition {
        run: CheckRun::Command {
            program: "npx".into(),
            args: vec!["vitest".into(), "{files}".into()],
        },
        ..command("unit", ValidationLevel::Standard, "")
    };
    let engine = ValidationEngine::new(config(vec![unit]), ".");
    let plan = engine.plan(&task(), ValidationLevel::Standard);

    assert_eq!(
        plan[0].run,
        CheckRun::Command {
            program: "npx".into(),
            args: vec!["vitest".into(), "src/parser.ts".into()],
        }
    );
    assert_eq!(plan[0].render(), "npx vitest src/parser.ts");
}

#[test]
fn level_selection() {
    let engine = ValidationEngine::new(ValidationConfig::default(), ".");
    let mut t = task();

    t.priority = TaskPriority::Low;
    assert_eq!(engine.select_level(&t), ValidationLevel::Quick);
    t.priority = TaskPriority::Critical;
    assert_eq!(engine.select_level(&t), ValidationLevel::Release);
    t.validation_level = Some(ValidationLevel::Standard);
    assert_eq!(engine.select_level(&t), ValidationLevel::Standard);

    let strict = ValidationEngine::new(
        ValidationConfig {
            minimum_level: ValidationLevel::Thorough,
            ..ValidationConfig::default()
        },
        ".",
    );
    assert_eq!(strict.select_level(&t), ValidationLevel::Thorough);
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn results_are_reported_in_declared_order() {
    let executor = ScriptedChecks {
        delays: HashMap::from([
            ("typecheck".to_string(), Duration::from_secs(30)),
            ("unit".to_string(), Duration::from_secs(1)),
        ]),
        ..ScriptedChecks::default()
    };
    let (engine, _) = scripted(ladder(), executor);

    let run = engine.validate(&task(), ValidationLevel::Standard, None).await;
    let names: Vec<_> = run.checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["typecheck", "unit", "build"]);
    assert!(run.passed);
    assert_eq!(run.level, ValidationLevel::Standard);
}

#[tokio::test(start_paused = true)]
async fn overall_pass_is_and_of_checks() {
    let executor = ScriptedChecks {
        failing: vec!["unit".into()],
        ..ScriptedChecks::default()
    };
    let (engine, _) = scripted(ladder(), executor);

    let run = engine.validate(&task(), ValidationLevel::Standard, None).await;
    assert!(!run.passed);
    let failing: Vec<_> = run.failing_checks().map(|c| c.name.as_str()).collect();
    assert_eq!(failing, vec!["unit"]);
    assert_eq!(run.checks[1].output_excerpt, "unit FAILED");

    // The same artifact passes at the lower level.
    let quick = engine.validate(&task(), ValidationLevel::Quick, None).await;
    assert!(quick.passed);
}

#[tokio::test(start_paused = true)]
async fn timed_out_check_counts_as_failed() {
    let executor = ScriptedChecks {
        delays: HashMap::from([("unit".to_string(), Duration::from_secs(600))]),
        ..ScriptedChecks::default()
    };
    let mut checks = ladder();
    checks[2].timeout_secs = Some(5);
    let (engine, _) = scripted(checks, executor);

    let run = engine.validate(&task(), ValidationLevel::Standard, None).await;
    let unit = &run.checks[1];
    assert_eq!(unit.name, "unit");
    assert!(!unit.passed);
    assert!(unit.timed_out);
    assert!(!run.passed);
}

#[tokio::test(start_paused = true)]
async fn parallelism_is_bounded() {
    let delays = ["typecheck", "unit", "build"]
        .into_iter()
        .map(|n| (n.to_string(), Duration::from_secs(10)))
        .collect();
    let executor = Arc::new(ScriptedChecks {
        delays,
        ..ScriptedChecks::default()
    });
    let engine = ValidationEngine::new(
        ValidationConfig {
            max_parallel_checks: 1,
            ..config(ladder())
        },
        ".",
    )
    .with_executor(executor.clone());

    let start = tokio::time::Instant::now();
    let run = engine.validate(&task(), ValidationLevel::Standard, None).await;
    assert!(run.passed);
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(*executor.started.lock().unwrap(), vec!["typecheck", "unit", "build"]);
}

#[tokio::test(start_paused = true)]
async fn empty_level_passes_and_is_recorded() {
    let (engine, _) = scripted(Vec::new(), ScriptedChecks::default());
    let store = MemoryStore::new();
    let mut t = task();
    t.file_impacts.clear();
    let session = Uuid::new_v4();

    let run = engine
        .validate_and_record(&store, &t, ValidationLevel::Release, Some(session))
        .await
        .unwrap();
    assert!(run.passed);
    assert!(run.checks.is_empty());

    let stored = store.list_validation_runs(t.id).await.unwrap();
    assert_eq!(stored, vec![run]);
    assert_eq!(stored[0].session_id, Some(session));
}

// ---------------------------------------------------------------------------
// Process executor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn process_checks_against_a_workspace() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/parser.ts"),
        "export function parse() {}\n",
    )
    .unwrap();

    let mut t = task();
    t.pass_criteria = vec![
        PassCriterion::checked(
            "parser exists",
            CheckRun::FileExists {
                path: "src/parser.ts".into(),
            },
        ),
        PassCriterion::checked(
            "exports parse",
            CheckRun::FileContains {
                path: "src/parser.ts".into(),
                needle: "export function parse".into(),
            },
        ),
        PassCriterion::checked(
            "no leftovers",
            CheckRun::FileAbsent {
                path: "src/parser.old.ts".into(),
            },
        ),
    ];
    let checks = vec![
        command("lint", ValidationLevel::Quick, "test -f src/parser.ts && echo lint ok"),
        CheckDefinition {
            expect: Expectation::ExitCode { code: 3 },
            ..command("exit-three", ValidationLevel::Standard, "echo nope >&2; exit 3")
        },
        CheckDefinition {
            expect: Expectation::OutputContains { text: "1 passed".into() },
            ..command("unit", ValidationLevel::Standard, "echo '1 passed'")
        },
    ];
    let engine = ValidationEngine::new(config(checks), dir.path());

    let run = engine.validate(&t, ValidationLevel::Thorough, None).await;
    for check in &run.checks {
        assert!(check.passed, "{} failed: {}", check.name, check.output_excerpt);
    }
    assert_eq!(run.checks.len(), 7);
    assert!(run.checks[0].output_excerpt.contains("lint ok"));
    assert!(run.checks[1].output_excerpt.contains("nope"));

    std::fs::remove_file(dir.path().join("src/parser.ts")).unwrap();
    let run = engine.validate(&t, ValidationLevel::Thorough, None).await;
    let failing: Vec<_> = run.failing_checks().map(|c| c.name.as_str()).collect();
    assert_eq!(
        failing,
        vec!["lint", "exists:src/parser.ts", "criterion-1", "criterion-2"]
    );
}

#[tokio::test]
async fn process_check_timeout_kills_the_command() {
    let mut slow = command("slow", ValidationLevel::Quick, "sleep 30");
    slow.timeout_secs = Some(1);
    let engine = ValidationEngine::new(config(vec![slow]), ".");

    let started = std::time::Instant::now();
    let run = engine.validate(&task(), ValidationLevel::Quick, None).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(run.checks[0].timed_out);
    assert!(!run.passed);
}
