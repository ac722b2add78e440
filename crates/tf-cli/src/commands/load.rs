use std::path::Path;

use anyhow::{bail, Context, Result};
use tf_core::config::Config;
use tf_core::graph::{GraphBuilder, TaskGraph, TaskListInput};
use tf_core::store::TaskGraphStore;
use tf_daemon::daemon::open_store;
use tracing::info;

pub async fn run(config: &Config, file: &Path) -> Result<()> {
    let input = TaskListInput::from_path(file)
        .with_context(|| format!("failed to read task list {}", file.display()))?;
    let store = open_store(config).await?;
    let graph = load_into(&store, input).await?;
    println!(
        "loaded '{}' ({} tasks, {} relationships) as {}",
        graph.name,
        graph.tasks.len(),
        graph.relationships.len(),
        graph.task_list_id
    );
    Ok(())
}

/// Build a task list and persist it after any tasks already stored.
pub async fn load_into(store: &dyn TaskGraphStore, input: TaskListInput) -> Result<TaskGraph> {
    let existing = store.list_tasks().await?;
    let next_sequence = existing.iter().map(|t| t.sequence + 1).max().unwrap_or(0);
    let graph = GraphBuilder::new(input.name.clone())
        .with_sequence_start(next_sequence)
        .build_from(input)?;

    if let Some(dup) = graph
        .tasks
        .iter()
        .find(|t| existing.iter().any(|e| e.display_id == t.display_id))
    {
        bail!("task key '{}' already exists in the store", dup.display_id);
    }
    store.insert_graph(&graph.tasks, &graph.relationships).await?;
    info!(
        task_list_id = %graph.task_list_id,
        tasks = graph.tasks.len(),
        first_sequence = next_sequence,
        "task list persisted"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tf_core::graph::GraphError;
    use tf_core::memory_store::MemoryStore;

    const LIST: &str = r#"{
        "name": "parser",
        "tasks": [
            {"key": "T1", "title": "lexer", "pass_criteria": ["tokens"],
             "file_impacts": [{"path": "src/lexer.rs", "operation": "create"}]},
            {"key": "T2", "title": "parser", "pass_criteria": ["ast"], "depends_on": ["T1"]}
        ]
    }"#;

    #[tokio::test]
    async fn second_list_continues_sequence_numbers() {
        let store = MemoryStore::new();
        load_into(&store, TaskListInput::from_json(LIST).unwrap()).await.unwrap();

        let mut second = TaskListInput::from_json(LIST).unwrap();
        second.name = "docs".into();
        for (i, t) in second.tasks.iter_mut().enumerate() {
            t.key = format!("D{}", i + 1);
        }
        second.tasks[1].depends_on = vec!["D1".into()];
        let graph = load_into(&store, second).await.unwrap();

        let seqs: Vec<u64> = graph.tasks.iter().map(|t| t.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(store.list_tasks().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn duplicate_keys_across_lists_are_rejected() {
        let store = MemoryStore::new();
        load_into(&store, TaskListInput::from_json(LIST).unwrap()).await.unwrap();
        let err = load_into(&store, TaskListInput::from_json(LIST).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'T1' already exists"));
        assert_eq!(store.list_tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cyclic_list_persists_nothing() {
        let store = MemoryStore::new();
        let cyclic = r#"{"name": "loop", "tasks": [
            {"key": "T6", "title": "a", "pass_criteria": ["x"], "depends_on": ["T7"]},
            {"key": "T7", "title": "b", "pass_criteria": ["y"], "depends_on": ["T6"]}
        ]}"#;
        let err = load_into(&store, TaskListInput::from_json(cyclic).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::Cycle { .. })));
        assert!(store.list_tasks().await.unwrap().is_empty());
    }
}
