use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{CheckDefinition, ValidationLevel};

/// Top-level configuration loaded from `~/.taskforge/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Config {
    /// Load config from `~/.taskforge/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agents.validate()?;
        self.validation.validate()?;
        if self.scheduler.max_concurrent_sessions == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(ConfigError::Validation(
                "retry.backoff_base_ms must not exceed retry.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        base_dir().join("config.toml")
    }
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskforge")
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(raw),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Working directory for workers and validation checks.
    #[serde(default)]
    pub workspace_root: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            workspace_root: None,
        }
    }
}

impl GeneralConfig {
    pub fn workspace_root(&self) -> PathBuf {
        match &self.workspace_root {
            Some(root) => expand_home(root),
            None => PathBuf::from("."),
        }
    }
}

fn default_project_name() -> String {
    "taskforge".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_store_path() -> String {
    "~/.taskforge/taskforge.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Upper bound on tasks per wave; 0 means unbounded.
    #[serde(default)]
    pub max_wave_size: usize,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_wave_size: 0,
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

fn default_max_concurrent_sessions() -> usize {
    8
}

/// A named external worker program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentsConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_min_budget")]
    pub min_budget_secs: u64,
    #[serde(default = "default_max_budget")]
    pub max_budget_secs: u64,
    #[serde(default = "default_output_capture_bytes")]
    pub output_capture_bytes: usize,
    #[serde(default)]
    pub default_worker: Option<String>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            missed_heartbeats: default_missed_heartbeats(),
            min_budget_secs: default_min_budget(),
            max_budget_secs: default_max_budget(),
            output_capture_bytes: default_output_capture_bytes(),
            default_worker: None,
            workers: Vec::new(),
        }
    }
}

impl AgentsConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "agents.heartbeat_interval_secs must be non-zero".into(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(ConfigError::Validation(
                "agents.missed_heartbeats must be at least 1".into(),
            ));
        }
        if self.min_budget_secs > self.max_budget_secs {
            return Err(ConfigError::Validation(format!(
                "agents.min_budget_secs ({}) exceeds agents.max_budget_secs ({})",
                self.min_budget_secs, self.max_budget_secs
            )));
        }
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate worker name '{}'",
                    worker.name
                )));
            }
        }
        if let Some(default) = &self.default_worker {
            if !self.workers.is_empty() && !seen.contains(default.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "agents.default_worker '{default}' is not a configured worker"
                )));
            }
        }
        Ok(())
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_missed_heartbeats() -> u32 {
    2
}
fn default_min_budget() -> u64 {
    300
}
fn default_max_budget() -> u64 {
    900
}
fn default_output_capture_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_transient_max")]
    pub transient_max_attempts: u32,
    #[serde(default = "default_one")]
    pub validation_max_attempts: u32,
    #[serde(default = "default_one")]
    pub timeout_max_attempts: u32,
    #[serde(default = "default_max_total")]
    pub max_total_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub allow_manual_resume: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient_max_attempts: default_transient_max(),
            validation_max_attempts: default_one(),
            timeout_max_attempts: default_one(),
            max_total_attempts: default_max_total(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            allow_manual_resume: true,
        }
    }
}

fn default_transient_max() -> u32 {
    3
}
fn default_one() -> u32 {
    1
}
fn default_max_total() -> u32 {
    6
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_max_parallel_checks")]
    pub max_parallel_checks: usize,
    #[serde(default = "default_minimum_level")]
    pub minimum_level: ValidationLevel,
    /// Ordered; declaration order is the reporting order.
    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: default_check_timeout(),
            max_parallel_checks: default_max_parallel_checks(),
            minimum_level: default_minimum_level(),
            checks: Vec::new(),
        }
    }
}

impl ValidationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_checks == 0 {
            return Err(ConfigError::Validation(
                "validation.max_parallel_checks must be at least 1".into(),
            ));
        }
        if self.check_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "validation.check_timeout_secs must be non-zero".into(),
            ));
        }
        let mut seen = HashSet::new();
        for check in &self.checks {
            if check.name.trim().is_empty() {
                return Err(ConfigError::Validation("check with empty name".into()));
            }
            if !seen.insert(check.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate check name '{}'",
                    check.name
                )));
            }
        }
        Ok(())
    }
}

fn default_check_timeout() -> u64 {
    120
}
fn default_max_parallel_checks() -> usize {
    4
}
fn default_minimum_level() -> ValidationLevel {
    ValidationLevel::Quick
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
