use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tf_core::types::{CheckRun, Expectation, ValidationLevel};
use tokio::process::Command;

/// Byte cap for output excerpts stored in a check result.
pub const EXCERPT_BYTES: usize = 4 * 1024;

// ---------------------------------------------------------------------------
// Planned checks
// ---------------------------------------------------------------------------

/// A check resolved for one task: arguments expanded, timeout fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCheck {
    pub name: String,
    pub description: String,
    pub level: ValidationLevel,
    pub run: CheckRun,
    pub expect: Expectation,
    pub timeout: Duration,
}

impl PlannedCheck {
    /// Human-readable rendering of what the check does.
    pub fn render(&self) -> String {
        if !self.description.is_empty() {
            return self.description.clone();
        }
        render_run(&self.run)
    }
}

pub fn render_run(run: &CheckRun) -> String {
    match run {
        CheckRun::Command { program, args } => {
            std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        }
        CheckRun::FileExists { path } => format!("file exists: {path}"),
        CheckRun::FileAbsent { path } => format!("file absent: {path}"),
        CheckRun::FileContains { path, needle } => format!("{path} contains {needle:?}"),
    }
}

/// Expand `{files}` in command arguments. An argument that is exactly
/// `{files}` becomes one argument per file; embedded occurrences are replaced
/// with the space-joined list.
pub fn expand_files(run: &CheckRun, files: &[String]) -> CheckRun {
    match run {
        CheckRun::Command { program, args } => {
            let mut expanded = Vec::with_capacity(args.len());
            for arg in args {
                if arg == "{files}" {
                    expanded.extend(files.iter().cloned());
                } else if arg.contains("{files}") {
                    expanded.push(arg.replace("{files}", &files.join(" ")));
                } else {
                    expanded.push(arg.clone());
                }
            }
            CheckRun::Command {
                program: program.clone(),
                args: expanded,
            }
        }
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// CheckExecutor
// ---------------------------------------------------------------------------

/// Raw result of running one check, before the timeout wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub passed: bool,
    pub output: String,
}

impl CheckOutput {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Executes a single check. Implementations never see the timeout; the
/// engine drops the future when it expires.
#[async_trait::async_trait]
pub trait CheckExecutor: Send + Sync {
    async fn execute(&self, check: &PlannedCheck, workdir: &Path) -> CheckOutput;
}

/// Runs commands through `tokio::process` and file checks against the
/// workspace.
#[derive(Debug, Default, Clone)]
pub struct ProcessCheckExecutor;

impl ProcessCheckExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run_command(program: &str, args: &[String], workdir: &Path) -> (Option<i32>, String) {
        let result = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        match result {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                (out.status.code(), text)
            }
            Err(e) => (None, format!("failed to run {program}: {e}")),
        }
    }

    async fn run_file_check(run: &CheckRun, workdir: &Path) -> (Option<i32>, String) {
        let holds = |ok: bool, msg: String| (Some(if ok { 0 } else { 1 }), msg);
        match run {
            CheckRun::FileExists { path } => {
                let ok = tokio::fs::try_exists(resolve(workdir, path))
                    .await
                    .unwrap_or(false);
                holds(ok, format!("{path}: {}", if ok { "exists" } else { "missing" }))
            }
            CheckRun::FileAbsent { path } => {
                let exists = tokio::fs::try_exists(resolve(workdir, path))
                    .await
                    .unwrap_or(false);
                holds(!exists, format!("{path}: {}", if exists { "present" } else { "absent" }))
            }
            CheckRun::FileContains { path, needle } => {
                match tokio::fs::read_to_string(resolve(workdir, path)).await {
                    Ok(content) => {
                        let ok = content.contains(needle.as_str());
                        holds(
                            ok,
                            format!(
                                "{path}: {} {needle:?}",
                                if ok { "contains" } else { "does not contain" }
                            ),
                        )
                    }
                    Err(e) => holds(false, format!("{path}: {e}")),
                }
            }
            CheckRun::Command { .. } => (None, String::new()),
        }
    }
}

#[async_trait::async_trait]
impl CheckExecutor for ProcessCheckExecutor {
    async fn execute(&self, check: &PlannedCheck, workdir: &Path) -> CheckOutput {
        let (code, output) = match &check.run {
            CheckRun::Command { program, args } => {
                Self::run_command(program, args, workdir).await
            }
            file_check => Self::run_file_check(file_check, workdir).await,
        };
        let passed = meets(&check.expect, code, &output);
        tracing::debug!(check = %check.name, exit_code = ?code, passed, "check finished");
        CheckOutput { passed, output }
    }
}

fn resolve(workdir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workdir.join(p)
    }
}

/// Whether an exit code and output satisfy `expect`. A missing exit code
/// (spawn failure, signal) never satisfies a success or exit-code
/// expectation.
pub fn meets(expect: &Expectation, code: Option<i32>, output: &str) -> bool {
    match expect {
        Expectation::Success => code == Some(0),
        Expectation::Failure => matches!(code, Some(c) if c != 0),
        Expectation::ExitCode { code: want } => code == Some(*want),
        Expectation::OutputContains { text } => output.contains(text.as_str()),
    }
}

/// Keep the head and tail of `text` within `max` bytes.
pub fn excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let half = max / 2;
    let mut head_end = half;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let omitted = tail_start - head_end;
    format!(
        "{}\n[...{omitted} bytes omitted...]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_placeholder_expands() {
        let run = CheckRun::Command {
            program: "cargo".into(),
            args: vec!["test".into(), "{files}".into(), "--files={files}".into()],
        };
        let files = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let CheckRun::Command { args, .. } = expand_files(&run, &files) else {
            panic!("command expected");
        };
        assert_eq!(
            args,
            vec!["test", "src/a.rs", "src/b.rs", "--files=src/a.rs src/b.rs"]
        );
    }

    #[test]
    fn expectations() {
        assert!(meets(&Expectation::Success, Some(0), ""));
        assert!(!meets(&Expectation::Success, None, ""));
        assert!(meets(&Expectation::Failure, Some(2), ""));
        assert!(!meets(&Expectation::Failure, None, ""));
        assert!(meets(&Expectation::ExitCode { code: 3 }, Some(3), ""));
        assert!(meets(
            &Expectation::OutputContains { text: "ok".into() },
            Some(1),
            "all ok"
        ));
    }

    #[test]
    fn excerpt_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(100), "z".repeat(100));
        let cut = excerpt(&text, 20);
        assert!(cut.starts_with("aaaaaaaaaa\n[..."));
        assert!(cut.ends_with("zzzzzzzzzz"));
        assert!(cut.contains("180 bytes omitted"));
        assert_eq!(excerpt("short", 20), "short");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let text = "é".repeat(50);
        let cut = excerpt(&text, 11);
        assert!(cut.contains("omitted"));
    }
}
