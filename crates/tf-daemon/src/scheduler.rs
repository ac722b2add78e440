use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tf_core::graph::DependencyIndex;
use tf_core::types::{RelationshipKind, Task, TaskRelationship, TaskStatus};
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Knobs for one planning pass that are not part of the stored graph.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    /// Pending tasks waiting out a retry backoff.
    pub deferred: HashSet<Uuid>,
    /// Upper bound on the wave size; `None` for unbounded.
    pub capacity: Option<usize>,
}

/// A pending task that can never become eligible on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledTask {
    pub task_id: Uuid,
    pub display_id: String,
    /// Undischarged prerequisites: display id and current status.
    pub waiting_on: Vec<(String, TaskStatus)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallReport {
    pub tasks: Vec<StalledTask>,
}

impl fmt::Display for StallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .tasks
            .iter()
            .map(|t| {
                let deps: Vec<String> = t
                    .waiting_on
                    .iter()
                    .map(|(id, status)| format!("{id} ({status})"))
                    .collect();
                format!("{} waits on {}", t.display_id, deps.join(", "))
            })
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WavePlan {
    /// Tasks to start now, in selection order. Never empty.
    Ready(Vec<Task>),
    /// Nothing can start yet, but running or deferred work will change that.
    Waiting,
    /// Pending tasks remain and none of them can ever become eligible.
    Stalled(StallReport),
    /// No pending or in-progress tasks remain.
    Complete,
}

// ---------------------------------------------------------------------------
// WaveScheduler
// ---------------------------------------------------------------------------

/// Computes the next wave from a snapshot of the task graph.
///
/// A task is eligible iff it is pending, not deferred, and every
/// prerequisite is completed. Eligible tasks are taken greedily by priority
/// (highest first), then creation sequence, then id; a candidate is skipped
/// when its file impacts conflict with, or an explicit `conflicts_with` edge
/// links it to, a task already selected or still in progress.
///
/// Planning is a pure function of its inputs: an unchanged snapshot always
/// yields the same wave.
pub struct WaveScheduler;

impl WaveScheduler {
    pub fn plan(tasks: &[Task], relationships: &[TaskRelationship], ctx: &PlanContext) -> WavePlan {
        let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
        let deps = DependencyIndex::from_relationships(relationships);
        let explicit = explicit_conflicts(relationships);

        let discharged = |prereq: &Uuid| {
            by_id
                .get(prereq)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        };

        let in_flight: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();
        let pending: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();

        let mut eligible: Vec<&Task> = pending
            .iter()
            .copied()
            .filter(|t| !ctx.deferred.contains(&t.id))
            .filter(|t| deps.prerequisites(&t.id).iter().all(discharged))
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
                .then(a.id.cmp(&b.id))
        });

        let clash = |a: &Task, b: &Task| {
            explicit.contains(&(a.id, b.id)) || a.conflicts_on_files(b)
        };

        let cap = ctx.capacity.unwrap_or(usize::MAX);
        let mut selected: Vec<&Task> = Vec::new();
        for &candidate in &eligible {
            if selected.len() >= cap {
                break;
            }
            if let Some(busy) = in_flight.iter().copied().find(|t| clash(candidate, *t)) {
                debug!(task = %candidate.display_id, in_flight = %busy.display_id, "deferred by in-flight conflict");
                continue;
            }
            if let Some(taken) = selected.iter().copied().find(|t| clash(candidate, *t)) {
                debug!(task = %candidate.display_id, selected = %taken.display_id, "deferred by wave conflict");
                continue;
            }
            selected.push(candidate);
        }

        if !selected.is_empty() {
            return WavePlan::Ready(selected.into_iter().cloned().collect());
        }
        if !in_flight.is_empty() || !eligible.is_empty() {
            return WavePlan::Waiting;
        }
        if pending.iter().any(|t| ctx.deferred.contains(&t.id)) {
            return WavePlan::Waiting;
        }
        if pending.is_empty() {
            return WavePlan::Complete;
        }

        let stalled = pending
            .iter()
            .map(|t| StalledTask {
                task_id: t.id,
                display_id: t.display_id.clone(),
                waiting_on: deps
                    .prerequisites(&t.id)
                    .iter()
                    .filter(|p| !discharged(*p))
                    .map(|p| match by_id.get(p) {
                        Some(dep) => (dep.display_id.clone(), dep.status),
                        None => (p.to_string(), TaskStatus::Pending),
                    })
                    .collect(),
            })
            .collect();
        WavePlan::Stalled(StallReport { tasks: stalled })
    }
}

/// `conflicts_with` edges as an order-independent pair set.
fn explicit_conflicts(relationships: &[TaskRelationship]) -> HashSet<(Uuid, Uuid)> {
    relationships
        .iter()
        .filter(|r| r.kind == RelationshipKind::ConflictsWith)
        .flat_map(|r| [(r.from_task, r.to_task), (r.to_task, r.from_task)])
        .collect()
}
