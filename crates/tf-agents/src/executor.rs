use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_core::config::{AgentsConfig, WorkerConfig};
use tf_core::types::{FileImpact, PassCriterion, RetryFeedback, Task};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::heartbeat::HeartbeatSender;
use crate::lifecycle::LifecycleError;

/// Line a process worker prints on stdout to signal liveness.
pub const HEARTBEAT_MARKER: &str = "::heartbeat::";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker could not be started at all.
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("worker io: {0}")]
    Io(String),
    /// Stopped through its cancellation token.
    #[error("worker cancelled")]
    Cancelled { partial_output: String },
}

// ---------------------------------------------------------------------------
// Invocation / output
// ---------------------------------------------------------------------------

/// Everything a worker receives for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub display_id: String,
    pub title: String,
    pub attempt: u32,
    pub file_impacts: Vec<FileImpact>,
    pub pass_criteria: Vec<PassCriterion>,
    pub sub_steps: Vec<String>,
    #[serde(default)]
    pub feedback: Option<RetryFeedback>,
}

impl WorkerInvocation {
    pub fn for_task(
        task: &Task,
        session_id: Uuid,
        attempt: u32,
        feedback: Option<RetryFeedback>,
    ) -> Self {
        Self {
            task_id: task.id,
            session_id,
            display_id: task.display_id.clone(),
            title: task.title.clone(),
            attempt,
            file_impacts: task.file_impacts.clone(),
            pass_criteria: task.pass_criteria.clone(),
            sub_steps: task.sub_steps.clone(),
            feedback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    pub exit_code: i32,
    /// Captured stdout/stderr tail.
    pub output: String,
}

impl WorkerOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker trait
// ---------------------------------------------------------------------------

/// The code-generation collaborator, seen only through its contract:
/// heartbeat while working, exit 0 on success, non-zero on failure.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> &str;

    async fn execute(
        &self,
        invocation: WorkerInvocation,
        heartbeat: HeartbeatSender,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput, WorkerError>;
}

// ---------------------------------------------------------------------------
// OutputTail
// ---------------------------------------------------------------------------

/// Keeps the last `cap` bytes of captured lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    cap: usize,
    lines: VecDeque<String>,
    bytes: usize,
    dropped: bool,
}

impl OutputTail {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: VecDeque::new(),
            bytes: 0,
            dropped: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.cap && self.lines.len() > 1 {
            if let Some(front) = self.lines.pop_front() {
                self.bytes -= front.len() + 1;
                self.dropped = true;
            }
        }
    }

    pub fn into_string(self) -> String {
        let mut out = String::with_capacity(self.bytes + 16);
        if self.dropped {
            out.push_str("[...truncated...]\n");
        }
        for line in self.lines {
            out.push_str(&line);
            out.push('\n');
        }
        if out.len() > self.cap + 18 {
            // A single oversized line: keep its tail on a char boundary.
            let mut start = out.len() - self.cap;
            while !out.is_char_boundary(start) {
                start += 1;
            }
            out = format!("[...truncated...]\n{}", &out[start..]);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ProcessWorker
// ---------------------------------------------------------------------------

/// Runs an external program per attempt.
///
/// The invocation is written to stdin as JSON and `TF_TASK_ID` /
/// `TF_SESSION_ID` are exported. Stdout lines equal to [`HEARTBEAT_MARKER`]
/// are heartbeats; every other stdout/stderr line is captured.
pub struct ProcessWorker {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    workdir: Option<PathBuf>,
    capture_bytes: usize,
}

impl ProcessWorker {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
            capture_bytes: 64 * 1024,
        }
    }

    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self::new(cfg.name.clone(), cfg.program.clone())
            .with_args(cfg.args.clone())
            .with_env(cfg.env.clone())
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_capture_bytes(mut self, bytes: usize) -> Self {
        self.capture_bytes = bytes;
        self
    }
}

fn pump_lines<R>(
    reader: R,
    lines: flume::Sender<String>,
    heartbeat: Option<HeartbeatSender>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if let Some(hb) = &heartbeat {
                        if line.trim() == HEARTBEAT_MARKER {
                            hb.beat();
                            continue;
                        }
                    }
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "worker output stream closed with error");
                    break;
                }
            }
        }
    })
}

#[async_trait::async_trait]
impl Worker for ProcessWorker {
    fn kind(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        invocation: WorkerInvocation,
        heartbeat: HeartbeatSender,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput, WorkerError> {
        let payload =
            serde_json::to_vec(&invocation).map_err(|e| WorkerError::Io(e.to_string()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("TF_TASK_ID", invocation.task_id.to_string())
            .env("TF_SESSION_ID", invocation.session_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {e}", self.program)))?;
        info!(
            task_id = %invocation.task_id,
            session_id = %invocation.session_id,
            worker = %self.name,
            pid = child.id().unwrap_or_default(),
            "worker process started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                // Workers that ignore stdin may close it early.
                debug!(error = %e, "worker did not consume invocation payload");
            }
            drop(stdin);
        }

        let (line_tx, line_rx) = flume::unbounded();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(stdout, line_tx.clone(), Some(heartbeat)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, line_tx.clone(), None));
        }
        drop(line_tx);

        let mut tail = OutputTail::new(self.capture_bytes);
        let mut streams_open = true;
        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill worker process");
                    }
                    for line in line_rx.drain() {
                        tail.push_line(&line);
                    }
                    return Err(WorkerError::Cancelled { partial_output: tail.into_string() });
                }
                line = line_rx.recv_async(), if streams_open => match line {
                    Ok(line) => tail.push_line(&line),
                    Err(_) => streams_open = false,
                },
                status = child.wait(), if !streams_open => {
                    break status.map_err(|e| WorkerError::Io(e.to_string()))?;
                }
            }
        };
        for pump in pumps {
            let _ = pump.await;
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(
            task_id = %invocation.task_id,
            exit_code,
            "worker process exited"
        );
        Ok(WorkerOutput {
            exit_code,
            output: tail.into_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

/// Maps agent-type names to worker implementations.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
    default: Option<String>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build process workers for every configured worker entry.
    pub fn from_config(cfg: &AgentsConfig, workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let mut registry = Self::new();
        for worker in &cfg.workers {
            let process = ProcessWorker::from_config(worker)
                .with_workdir(workdir.clone())
                .with_capture_bytes(cfg.output_capture_bytes);
            registry.register(Arc::new(process));
        }
        registry.default = cfg
            .default_worker
            .clone()
            .or_else(|| cfg.workers.first().map(|w| w.name.clone()));
        registry
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        let name = worker.kind().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.workers.insert(name, worker);
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Resolve the worker for a task's agent type, falling back to the
    /// default worker.
    pub fn resolve(&self, agent_type: Option<&str>) -> Result<Arc<dyn Worker>, LifecycleError> {
        let name = match agent_type.or(self.default.as_deref()) {
            Some(name) => name,
            None => return Err(LifecycleError::NoWorker),
        };
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownWorker(name.to_string()))
    }
}
