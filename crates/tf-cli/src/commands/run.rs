use anyhow::Result;
use tf_core::config::Config;
use tf_daemon::daemon::Daemon;

use super::status;

pub async fn run(config: Config) -> Result<()> {
    let daemon = Daemon::new(config).await?;
    daemon.install_ctrl_c();
    let status = daemon.run().await?;
    println!(
        "run {:?} after {} waves: {} sessions, {} retries, {} escalations, {} aborts",
        status.state,
        status.wave,
        status.sessions_spawned,
        status.retries,
        status.escalations,
        status.aborts
    );
    println!("{}", status::render(&status.counts));
    Ok(())
}
