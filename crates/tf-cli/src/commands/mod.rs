pub mod load;
pub mod plan;
pub mod run;
pub mod status;
pub mod task;

use std::path::Path;

use anyhow::{Context, Result};
use tf_core::config::Config;

use crate::{Cli, Commands};

/// Load config from `--config` (or the default location) and apply `--db`.
pub fn load_config(config: Option<&Path>, db: Option<&Path>) -> Result<Config> {
    let mut cfg = match config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(db) = db {
        cfg.store.path = db.display().to_string();
    }
    Ok(cfg)
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref(), cli.db.as_deref())?;
    tf_daemon::daemon::init_logging(&config, "tf");

    match cli.command {
        Commands::Load { file } => load::run(&config, &file).await,
        Commands::Plan => plan::run(&config).await,
        Commands::Run => run::run(config).await,
        Commands::Status => status::run(&config).await,
        Commands::History { task } => task::history(&config, &task).await,
        Commands::Cancel { task } => task::cancel(&config, &task).await,
        Commands::Resume { task } => task::resume(&config, &task).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_flag_overrides_store_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("config.toml");
        std::fs::write(&cfg_path, "[store]\npath = \"/var/lib/tf.db\"\n").unwrap();

        let cfg = load_config(Some(&cfg_path), None).unwrap();
        assert_eq!(cfg.store.path, "/var/lib/tf.db");

        let db = dir.path().join("other.db");
        let cfg = load_config(Some(&cfg_path), Some(&db)).unwrap();
        assert_eq!(cfg.store.resolved_path(), db);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/tf.toml")), None).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tf.toml"));
    }
}
