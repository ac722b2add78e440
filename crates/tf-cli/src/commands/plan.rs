use anyhow::Result;
use tf_core::config::Config;
use tf_core::store::TaskGraphStore;
use tf_core::types::TaskStatus;
use tf_daemon::daemon::open_store;
use tf_daemon::orchestrator::OrchestratorError;
use tf_daemon::scheduler::{PlanContext, WavePlan, WaveScheduler};

pub async fn run(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let plan = next_wave(&store, config).await?;
    println!("{}", render(&plan));
    if let WavePlan::Stalled(report) = plan {
        return Err(OrchestratorError::SchedulingStall(report).into());
    }
    Ok(())
}

/// The wave the orchestrator would start next from the stored graph.
pub async fn next_wave(store: &dyn TaskGraphStore, config: &Config) -> Result<WavePlan> {
    let tasks = store.list_tasks().await?;
    let relationships = store.list_relationships().await?;
    let running = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    let slots = config
        .scheduler
        .max_concurrent_sessions
        .saturating_sub(running);
    let capacity = match config.scheduler.max_wave_size {
        0 => slots,
        max => slots.min(max),
    };
    let ctx = PlanContext {
        capacity: Some(capacity),
        ..PlanContext::default()
    };
    Ok(WaveScheduler::plan(&tasks, &relationships, &ctx))
}

pub fn render(plan: &WavePlan) -> String {
    match plan {
        WavePlan::Ready(wave) => {
            let mut out = format!("next wave ({} tasks):", wave.len());
            for t in wave {
                out.push_str(&format!("\n  {:<10} [{}] {}", t.display_id, t.priority, t.title));
            }
            out
        }
        WavePlan::Waiting => "nothing can start until running tasks finish".to_string(),
        WavePlan::Complete => "all tasks settled".to_string(),
        WavePlan::Stalled(report) => format!("scheduling stall: {report}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tf_core::graph::{GraphBuilder, TaskListInput};
    use tf_core::memory_store::MemoryStore;

    #[tokio::test]
    async fn plan_respects_wave_size() {
        let store = MemoryStore::new();
        let input = TaskListInput::from_json(
            r#"{"name": "p", "tasks": [
                {"key": "A", "title": "a", "pass_criteria": ["x"]},
                {"key": "B", "title": "b", "pass_criteria": ["x"], "priority": "high"},
                {"key": "C", "title": "c", "pass_criteria": ["x"]}
            ]}"#,
        )
        .unwrap();
        let graph = GraphBuilder::from_input(input).unwrap();
        store.insert_graph(&graph.tasks, &graph.relationships).await.unwrap();

        let mut config = Config::default();
        config.scheduler.max_wave_size = 2;
        let plan = next_wave(&store, &config).await.unwrap();
        let text = render(&plan);
        assert!(text.starts_with("next wave (2 tasks):"), "{text}");
        let b = text.find("B ").unwrap();
        let a = text.find("A ").unwrap();
        assert!(b < a, "{text}");
        assert!(!text.contains("C "), "{text}");
    }

    #[test]
    fn renders_terminal_states() {
        assert_eq!(render(&WavePlan::Complete), "all tasks settled");
        assert!(render(&WavePlan::Waiting).contains("running tasks"));
    }
}
