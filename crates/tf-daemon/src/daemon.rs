use std::sync::Arc;

use anyhow::{Context, Result};
use tf_agents::executor::WorkerRegistry;
use tf_core::config::{Config, LogFormat};
use tf_core::store::SqliteStore;
use tf_telemetry::logging::{self, Format};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::orchestrator::{Orchestrator, WaveStatus};

/// Initialise logging from the `[general]` section.
pub fn init_logging(config: &Config, service: &str) {
    let format = match config.general.log_format {
        LogFormat::Human => Format::Human,
        LogFormat::Json => Format::Json,
    };
    logging::init(service, &config.general.log_level, format);
}

/// Open the SQLite store at `store.path`, creating its directory first.
pub async fn open_store(config: &Config) -> Result<SqliteStore> {
    let path = config.store.resolved_path();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    SqliteStore::new(&path)
        .await
        .with_context(|| format!("failed to open task store at {}", path.display()))
}

/// Long-running host for one orchestrator run.
///
/// Owns the store and a shutdown token; cancelling the token (ctrl-c or
/// [`Daemon::shutdown`]) asks the orchestrator to stop gracefully: live
/// sessions are cancelled and their tasks return to pending.
pub struct Daemon {
    config: Config,
    store: Arc<SqliteStore>,
    registry: WorkerRegistry,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn with_store(config: Config, store: Arc<SqliteStore>) -> Self {
        let registry = WorkerRegistry::from_config(&config.agents, config.general.workspace_root());
        Self {
            config,
            store,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Open (or create) the store named in config.
    pub async fn new(config: Config) -> Result<Self> {
        let store = open_store(&config).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Replace the workers built from `[agents]`.
    pub fn with_registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::clone(&self.store)
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(&self.config, self.store.clone(), self.registry.clone())
            .with_patterns(self.store.clone())
    }

    /// Wire ctrl-c to the shutdown token.
    pub fn install_ctrl_c(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received, initiating shutdown");
            shutdown.cancel();
        });
    }

    /// Run the orchestrator until the graph settles or shutdown completes.
    ///
    /// A scheduling stall surfaces as an [`OrchestratorError`] inside the
    /// returned error and can be recovered with `downcast_ref`.
    ///
    /// [`OrchestratorError`]: crate::orchestrator::OrchestratorError
    pub async fn run(&self) -> Result<WaveStatus> {
        if self.registry.is_empty() {
            warn!("no workers configured; every task will be aborted as misconfigured");
        }
        let orchestrator = self.orchestrator();
        let handle = orchestrator.handle();
        let token = self.shutdown.clone();
        let watcher = tokio::spawn(async move {
            token.cancelled().await;
            handle.shutdown();
        });

        let result = orchestrator.run().await;
        watcher.abort();
        let status = result?;
        info!(
            state = ?status.state,
            waves = status.wave,
            sessions = status.sessions_spawned,
            retries = status.retries,
            escalations = status.escalations,
            "daemon run finished"
        );
        Ok(status)
    }
}
