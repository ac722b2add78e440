use anyhow::Result;
use tf_core::config::Config;
use tf_daemon::control;
use tf_daemon::daemon::open_store;

pub async fn history(config: &Config, key: &str) -> Result<()> {
    let store = open_store(config).await?;
    let task = control::find_task(&store, key).await?;
    let history = control::task_history(&store, task.id).await?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

pub async fn cancel(config: &Config, key: &str) -> Result<()> {
    let store = open_store(config).await?;
    let task = control::find_task(&store, key).await?;
    let task = control::cancel_task(&store, task.id).await?;
    println!("{} -> {}", task.display_id, task.status);
    Ok(())
}

pub async fn resume(config: &Config, key: &str) -> Result<()> {
    let store = open_store(config).await?;
    let task = control::find_task(&store, key).await?;
    let task = control::resume_task(&store, &config.retry, task.id).await?;
    println!(
        "{} -> {} ({} earlier attempts kept)",
        task.display_id, task.status, task.retry_count
    );
    Ok(())
}
