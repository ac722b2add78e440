//! Task list input and the graph builder.
//!
//! The decomposer hands us a [`TaskListInput`]; [`GraphBuilder`] turns it into
//! stored [`Task`]s and [`TaskRelationship`]s, rejecting anything malformed
//! before a single task can be scheduled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    normalize_path, Effort, FileImpact, PassCriterion, RelationshipKind, Task, TaskCategory,
    TaskPriority, TaskRelationship, ValidationLevel,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task with empty key")]
    EmptyKey,
    #[error("task '{0}' has an empty title")]
    EmptyTitle(String),
    #[error("duplicate task key '{0}'")]
    DuplicateKey(String),
    #[error("task '{0}' declares no pass criteria")]
    MissingPassCriteria(String),
    #[error("task '{from}' references unknown task '{to}'")]
    UnknownReference { from: String, to: String },
    #[error("task '{0}' references itself")]
    SelfReference(String),
    #[error("task '{key}' has an invalid file impact: {reason}")]
    InvalidFileImpact { key: String, reason: String },
    #[error("task '{0}' declares a zero session budget")]
    ZeroBudget(String),
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("parse: {0}")]
    Parse(String),
    #[error("io: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// Input format
// ---------------------------------------------------------------------------

/// A pass criterion as written by the decomposer: either plain prose or a
/// full structured criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriterionInput {
    Text(String),
    Structured(PassCriterion),
}

impl From<CriterionInput> for PassCriterion {
    fn from(input: CriterionInput) -> Self {
        match input {
            CriterionInput::Text(text) => PassCriterion::manual(text),
            CriterionInput::Structured(criterion) => criterion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub effort: Effort,
    #[serde(default)]
    pub file_impacts: Vec<FileImpact>,
    #[serde(default)]
    pub pass_criteria: Vec<CriterionInput>,
    #[serde(default)]
    pub sub_steps: Vec<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub validation_level: Option<ValidationLevel>,
    #[serde(default)]
    pub budget_secs: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    #[serde(default)]
    pub related_to: Vec<String>,
    #[serde(default)]
    pub duplicate_of: Vec<String>,
    #[serde(default)]
    pub subtask_of: Vec<String>,
}

impl TaskInput {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            category: TaskCategory::default(),
            priority: TaskPriority::default(),
            effort: Effort::default(),
            file_impacts: Vec::new(),
            pass_criteria: Vec::new(),
            sub_steps: Vec::new(),
            agent_type: None,
            validation_level: None,
            budget_secs: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            conflicts_with: Vec::new(),
            related_to: Vec::new(),
            duplicate_of: Vec::new(),
            subtask_of: Vec::new(),
        }
    }

    fn edges(&self) -> impl Iterator<Item = (RelationshipKind, &String)> {
        let lists: [(RelationshipKind, &Vec<String>); 6] = [
            (RelationshipKind::DependsOn, &self.depends_on),
            (RelationshipKind::Blocks, &self.blocks),
            (RelationshipKind::ConflictsWith, &self.conflicts_with),
            (RelationshipKind::RelatedTo, &self.related_to),
            (RelationshipKind::DuplicateOf, &self.duplicate_of),
            (RelationshipKind::SubtaskOf, &self.subtask_of),
        ];
        lists
            .into_iter()
            .flat_map(|(kind, targets)| targets.iter().map(move |t| (kind, t)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskListInput {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskInput>,
}

impl TaskListInput {
    /// Read a task list from a `.json` or `.toml` file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Io(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Dependency index
// ---------------------------------------------------------------------------

/// `waiter -> prerequisites` adjacency built from ordering edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    prereqs: HashMap<Uuid, Vec<Uuid>>,
}

impl DependencyIndex {
    pub fn from_relationships<'a>(rels: impl IntoIterator<Item = &'a TaskRelationship>) -> Self {
        let mut index = Self::default();
        for rel in rels {
            if let Some((waiter, prereq)) = rel.as_dependency() {
                index.insert(waiter, prereq);
            }
        }
        index
    }

    pub fn insert(&mut self, waiter: Uuid, prereq: Uuid) {
        let entry = self.prereqs.entry(waiter).or_default();
        if !entry.contains(&prereq) {
            entry.push(prereq);
        }
    }

    /// Direct prerequisites of `task`.
    pub fn prerequisites(&self, task: &Uuid) -> &[Uuid] {
        self.prereqs.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Path `from -> ... -> to` following prerequisite edges, if one exists.
    pub fn path(&self, from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
        let mut parent: HashMap<Uuid, Uuid> = HashMap::new();
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                let mut path = vec![to];
                let mut cur = to;
                while let Some(prev) = parent.get(&cur) {
                    path.push(*prev);
                    cur = *prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.prerequisites(&node) {
                if seen.insert(*next) {
                    parent.insert(*next, node);
                    queue.push_back(*next);
                }
            }
        }
        None
    }

    /// Returns `true` when `task` waits on `other`, directly or transitively.
    pub fn depends_transitively(&self, task: Uuid, other: Uuid) -> bool {
        task != other && self.path(task, other).is_some()
    }

    /// The cycle a new `waiter -> prereq` edge would close, if any.
    ///
    /// The returned path starts and ends at `waiter`.
    pub fn cycle_with(&self, waiter: Uuid, prereq: Uuid) -> Option<Vec<Uuid>> {
        if waiter == prereq {
            return Some(vec![waiter, waiter]);
        }
        self.path(prereq, waiter).map(|tail| {
            let mut cycle = Vec::with_capacity(tail.len() + 1);
            cycle.push(waiter);
            cycle.extend(tail);
            cycle
        })
    }

    /// Kahn's algorithm over `nodes`; returns the nodes left on a cycle when
    /// no topological order exists.
    pub fn topological_order(&self, nodes: &[Uuid]) -> std::result::Result<Vec<Uuid>, Vec<Uuid>> {
        let known: HashSet<Uuid> = nodes.iter().copied().collect();
        let mut indegree: HashMap<Uuid, usize> = nodes.iter().map(|n| (*n, 0)).collect();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for waiter in nodes {
            for prereq in self.prerequisites(waiter) {
                if known.contains(prereq) {
                    *indegree.entry(*waiter).or_default() += 1;
                    dependents.entry(*prereq).or_default().push(*waiter);
                }
            }
        }

        let mut queue: VecDeque<Uuid> = nodes
            .iter()
            .filter(|n| indegree.get(n).copied() == Some(0))
            .copied()
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for dep in dependents.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(d) = indegree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*dep);
                    }
                }
            }
        }

        if order.len() == nodes.len() {
            Ok(order)
        } else {
            let placed: HashSet<Uuid> = order.iter().copied().collect();
            Err(nodes.iter().filter(|n| !placed.contains(n)).copied().collect())
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A validated task list, ready to be persisted in one transaction.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub task_list_id: Uuid,
    pub name: String,
    pub tasks: Vec<Task>,
    pub relationships: Vec<TaskRelationship>,
}

impl TaskGraph {
    pub fn task_by_key(&self, key: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.display_id == key)
    }
}

pub struct GraphBuilder {
    task_list_id: Uuid,
    name: String,
    tasks: Vec<Task>,
    keys: HashMap<String, Uuid>,
    relationships: Vec<TaskRelationship>,
    deps: DependencyIndex,
    next_sequence: u64,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            task_list_id: Uuid::new_v4(),
            name: name.into(),
            tasks: Vec::new(),
            keys: HashMap::new(),
            relationships: Vec::new(),
            deps: DependencyIndex::default(),
            next_sequence: 0,
        }
    }

    /// Continue sequence numbering after tasks that already exist.
    pub fn with_sequence_start(mut self, start: u64) -> Self {
        self.next_sequence = start;
        self
    }

    /// Validate and build a whole task list. Tasks are added first so that
    /// relationships may reference tasks declared later in the list.
    pub fn from_input(input: TaskListInput) -> Result<TaskGraph> {
        Self::new(input.name.clone()).build_from(input)
    }

    pub fn build_from(mut self, input: TaskListInput) -> Result<TaskGraph> {
        for task in &input.tasks {
            self.add_task(task.clone())?;
        }
        for task in &input.tasks {
            for (kind, target) in task.edges() {
                self.add_relationship(&task.key, target, kind)?;
            }
        }
        self.build()
    }

    /// Add one task; relationships listed on the input are ignored here.
    pub fn add_task(&mut self, input: TaskInput) -> Result<Uuid> {
        let key = input.key.trim().to_string();
        if key.is_empty() {
            return Err(GraphError::EmptyKey);
        }
        if input.title.trim().is_empty() {
            return Err(GraphError::EmptyTitle(key));
        }
        if self.keys.contains_key(&key) {
            return Err(GraphError::DuplicateKey(key));
        }
        if input.pass_criteria.is_empty() {
            return Err(GraphError::MissingPassCriteria(key));
        }
        if input.budget_secs == Some(0) {
            return Err(GraphError::ZeroBudget(key));
        }
        let mut impacts = Vec::with_capacity(input.file_impacts.len());
        for impact in input.file_impacts {
            let path = normalize_path(&impact.path);
            if path.is_empty() {
                return Err(GraphError::InvalidFileImpact {
                    key,
                    reason: "empty path".into(),
                });
            }
            if !(0.0..=1.0).contains(&impact.confidence) {
                return Err(GraphError::InvalidFileImpact {
                    key,
                    reason: format!("confidence {} outside [0, 1]", impact.confidence),
                });
            }
            impacts.push(FileImpact { path, ..impact });
        }

        let mut task = Task::new(key.clone(), input.title.trim(), self.task_list_id);
        task.category = input.category;
        task.priority = input.priority;
        task.effort = input.effort;
        task.file_impacts = impacts;
        task.pass_criteria = input.pass_criteria.into_iter().map(Into::into).collect();
        task.sub_steps = input.sub_steps;
        task.agent_type = input.agent_type;
        task.validation_level = input.validation_level;
        task.budget_secs = input.budget_secs;
        task.sequence = self.next_sequence;
        self.next_sequence += 1;

        let id = task.id;
        self.keys.insert(key, id);
        self.tasks.push(task);
        Ok(id)
    }

    /// Add an edge between two known keys, rejecting it if it would close a
    /// depends_on/blocks cycle.
    pub fn add_relationship(&mut self, from: &str, to: &str, kind: RelationshipKind) -> Result<()> {
        let from_id = self.lookup(from, from)?;
        let to_id = self.lookup(from, to)?;
        if from_id == to_id {
            return Err(GraphError::SelfReference(from.to_string()));
        }
        let rel = TaskRelationship::new(from_id, to_id, kind);
        if let Some((waiter, prereq)) = rel.as_dependency() {
            if let Some(cycle) = self.deps.cycle_with(waiter, prereq) {
                return Err(GraphError::Cycle {
                    path: self.display_path(&cycle),
                });
            }
            self.deps.insert(waiter, prereq);
        }
        self.relationships.push(rel);
        Ok(())
    }

    pub fn build(self) -> Result<TaskGraph> {
        let ids: Vec<Uuid> = self.tasks.iter().map(|t| t.id).collect();
        if let Err(remaining) = self.deps.topological_order(&ids) {
            return Err(GraphError::Cycle {
                path: self.display_path(&remaining),
            });
        }
        tracing::debug!(
            task_list = %self.name,
            tasks = self.tasks.len(),
            relationships = self.relationships.len(),
            "task graph built"
        );
        Ok(TaskGraph {
            task_list_id: self.task_list_id,
            name: self.name,
            tasks: self.tasks,
            relationships: self.relationships,
        })
    }

    fn lookup(&self, from: &str, key: &str) -> Result<Uuid> {
        self.keys
            .get(key.trim())
            .copied()
            .ok_or_else(|| GraphError::UnknownReference {
                from: from.to_string(),
                to: key.to_string(),
            })
    }

    fn display_path(&self, ids: &[Uuid]) -> Vec<String> {
        ids.iter()
            .map(|id| {
                self.tasks
                    .iter()
                    .find(|t| t.id == *id)
                    .map(|t| t.display_id.clone())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_finds_transitive_dependency() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut idx = DependencyIndex::default();
        idx.insert(a, b);
        idx.insert(b, c);
        assert!(idx.depends_transitively(a, c));
        assert!(!idx.depends_transitively(c, a));
        assert_eq!(idx.cycle_with(c, a), Some(vec![c, a, b, c]));
    }

    #[test]
    fn topological_order_reports_cycle_members() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut idx = DependencyIndex::default();
        idx.insert(a, b);
        idx.insert(b, a);
        let err = idx.topological_order(&[a, b, c]).unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(!err.contains(&c));
    }
}
