//! Optional dependency inference over ready tasks.
//!
//! When `auto_deps` is enabled the orchestrator periodically asks a worker
//! to infer blocker edges among unanalyzed ready tasks. Edges are applied
//! with unknown-id, self-edge, and cycle rejection; candidates are marked
//! analyzed whatever the outcome so the queue can never wedge on a flaky
//! analyzer.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde_json::json;

use foreman_store::models::{DepCandidate, DepExisting, InferredDep, Task, TaskStatus};
use foreman_store::StateStore;

use crate::adapter::{DependencyEdge, WorkerAdapter};

/// Would adding `from -> to` close a cycle? True when `to` already reaches
/// `from` through the existing blocks graph.
fn has_cycle(adj: &HashMap<String, Vec<String>>, from_id: &str, to_id: &str) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![to_id];
    while let Some(node) = stack.pop() {
        if node == from_id {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = adj.get(node) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

/// Run one dependency-analysis pass. Returns the number of edges applied.
pub async fn analyze_dependencies(
    store: &StateStore,
    adapter: &dyn WorkerAdapter,
) -> Result<usize> {
    let all_tasks = store.tasks.list()?;

    let candidates: Vec<Task> = all_tasks
        .iter()
        .filter(|t| {
            t.status == TaskStatus::Ready
                && t.metadata.deps_analyzed != Some(true)
                && t.source != "prd_import"
        })
        .cloned()
        .collect();

    let mark_analyzed = |tasks: &[Task]| -> Result<()> {
        for task in tasks {
            // Re-read so we never clobber concurrent updates.
            if let Some(mut fresh) = store.tasks.get(&task.id)? {
                fresh.metadata.deps_analyzed = Some(true);
                store.tasks.upsert(fresh)?;
            }
        }
        Ok(())
    };

    if candidates.len() < 2 {
        mark_analyzed(&candidates)?;
        return Ok(0);
    }

    let existing: Vec<DepExisting> = all_tasks
        .iter()
        .filter(|t| t.metadata.deps_analyzed == Some(true) && !t.status.is_terminal())
        .map(|t| DepExisting {
            id: t.id.clone(),
            title: t.title.clone(),
            status: t.status,
        })
        .collect();

    // Transient task carrying the analysis context; never persisted.
    let mut synthetic = Task::new("Dependency analysis", "research");
    synthetic.source = "system".to_string();
    synthetic.metadata.candidate_tasks = Some(
        candidates
            .iter()
            .map(|t| DepCandidate {
                id: t.id.clone(),
                title: t.title.clone(),
                description: t.description.chars().take(200).collect(),
                task_type: t.task_type.clone(),
                labels: t.labels.clone(),
            })
            .collect(),
    );
    synthetic.metadata.existing_tasks = Some(existing);

    let result = adapter.run_step(&synthetic, "analyze_deps", 1).await;

    let applied = if result.is_ok() && !result.dependency_edges.is_empty() {
        match apply_dependency_edges(store, &result.dependency_edges) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "failed to apply inferred dependency edges");
                0
            }
        }
    } else {
        if !result.is_ok() {
            tracing::warn!(
                summary = result.summary.as_deref().unwrap_or(""),
                "dependency analysis step failed; tasks will run without inferred deps"
            );
        }
        0
    };

    mark_analyzed(&candidates)?;
    Ok(applied)
}

/// Apply inferred edges with cycle detection. Returns the count applied.
fn apply_dependency_edges(store: &StateStore, edges: &[DependencyEdge]) -> Result<usize> {
    let tasks = store.tasks.list()?;
    let known: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();

    // blocks-direction adjacency: blocker id -> tasks it blocks.
    let mut adj: HashMap<String, Vec<String>> = HashMap::new();
    for task in &tasks {
        for dep_id in &task.blocked_by {
            adj.entry(dep_id.clone()).or_default().push(task.id.clone());
        }
    }

    let mut applied = 0;
    for edge in edges {
        if edge.from.is_empty() || edge.to.is_empty() {
            continue;
        }
        if !known.contains(&edge.from) || !known.contains(&edge.to) {
            tracing::warn!(from = %edge.from, to = %edge.to, "skipping edge with unknown task id");
            continue;
        }
        if edge.from == edge.to {
            continue;
        }
        if has_cycle(&adj, &edge.from, &edge.to) {
            tracing::warn!(from = %edge.from, to = %edge.to, "skipping edge: would create cycle");
            continue;
        }

        let Some(mut to_task) = store.tasks.get(&edge.to)? else { continue };
        let Some(mut from_task) = store.tasks.get(&edge.from)? else { continue };

        if !to_task.blocked_by.contains(&edge.from) {
            to_task.blocked_by.push(edge.from.clone());
        }
        if !from_task.blocks.contains(&edge.to) {
            from_task.blocks.push(edge.to.clone());
        }
        to_task
            .metadata
            .inferred_deps
            .get_or_insert_with(Vec::new)
            .push(InferredDep {
                from: edge.from.clone(),
                reason: edge.reason.clone(),
            });

        store.tasks.upsert(from_task)?;
        store.tasks.upsert(to_task)?;
        adj.entry(edge.from.clone()).or_default().push(edge.to.clone());
        applied += 1;

        store.events.append(
            "tasks",
            "task.dependency_inferred",
            &edge.to,
            json!({"from": edge.from, "to": edge.to, "reason": edge.reason}),
        )?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StepResult;
    use async_trait::async_trait;
    use foreman_test_utils::create_temp_store;
    use std::sync::Mutex;

    /// Stub analyzer returning a canned edge list once.
    struct EdgeStub {
        edges: Mutex<Vec<DependencyEdge>>,
        calls: Mutex<u32>,
    }

    impl EdgeStub {
        fn new(edges: Vec<DependencyEdge>) -> Self {
            Self {
                edges: Mutex::new(edges),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl WorkerAdapter for EdgeStub {
        async fn run_step(&self, task: &Task, step: &str, _attempt: u32) -> StepResult {
            assert_eq!(step, "analyze_deps");
            assert!(task.metadata.candidate_tasks.is_some());
            *self.calls.lock().unwrap() += 1;
            StepResult {
                dependency_edges: std::mem::take(&mut *self.edges.lock().unwrap()),
                ..StepResult::ok()
            }
        }
    }

    fn edge(from: &str, to: &str) -> DependencyEdge {
        DependencyEdge {
            from: from.into(),
            to: to.into(),
            reason: "test".into(),
        }
    }

    fn ready_task(store: &StateStore, id: &str, title: &str) -> Task {
        let mut task = Task::new(title, "feature");
        task.id = id.to_string();
        task.status = TaskStatus::Ready;
        store.tasks.upsert(task.clone()).unwrap();
        task
    }

    #[tokio::test]
    async fn cycle_edge_rejected_others_applied() {
        let (_dir, store) = create_temp_store();
        ready_task(&store, "task-a", "A");
        ready_task(&store, "task-b", "B");
        ready_task(&store, "task-c", "C");

        let stub = EdgeStub::new(vec![
            edge("task-a", "task-b"),
            edge("task-b", "task-c"),
            edge("task-c", "task-a"), // closes the loop; must be rejected
        ]);

        let applied = analyze_dependencies(&store, &stub).await.unwrap();
        assert_eq!(applied, 2);

        let a = store.tasks.get("task-a").unwrap().unwrap();
        let b = store.tasks.get("task-b").unwrap().unwrap();
        let c = store.tasks.get("task-c").unwrap().unwrap();

        assert!(a.blocked_by.is_empty());
        assert_eq!(b.blocked_by, vec!["task-a"]);
        assert_eq!(c.blocked_by, vec!["task-b"]);
        assert_eq!(a.blocks, vec!["task-b"]);
        assert_eq!(b.blocks, vec!["task-c"]);
        assert!(c.blocks.is_empty());

        for task in [&a, &b, &c] {
            assert_eq!(task.metadata.deps_analyzed, Some(true), "{}", task.id);
        }
        // Traceability on the blocked side only.
        assert!(a.metadata.inferred_deps.is_none());
        assert_eq!(b.metadata.inferred_deps.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fewer_than_two_candidates_skips_worker() {
        let (_dir, store) = create_temp_store();
        ready_task(&store, "task-solo", "Solo");

        let stub = EdgeStub::new(vec![]);
        let applied = analyze_dependencies(&store, &stub).await.unwrap();

        assert_eq!(applied, 0);
        assert_eq!(stub.calls(), 0, "analyzer must not run for one candidate");
        let solo = store.tasks.get("task-solo").unwrap().unwrap();
        assert_eq!(solo.metadata.deps_analyzed, Some(true));
    }

    #[tokio::test]
    async fn analyzed_and_imported_tasks_are_not_candidates() {
        let (_dir, store) = create_temp_store();
        let mut analyzed = Task::new("Old", "feature");
        analyzed.status = TaskStatus::Ready;
        analyzed.metadata.deps_analyzed = Some(true);
        store.tasks.upsert(analyzed).unwrap();

        let mut imported = Task::new("Imported", "feature");
        imported.status = TaskStatus::Ready;
        imported.source = "prd_import".to_string();
        store.tasks.upsert(imported.clone()).unwrap();

        ready_task(&store, "task-new", "New");

        let stub = EdgeStub::new(vec![]);
        analyze_dependencies(&store, &stub).await.unwrap();

        // Only one candidate (task-new): worker skipped, imported untouched.
        assert_eq!(stub.calls(), 0);
        let imported = store.tasks.get(&imported.id).unwrap().unwrap();
        assert!(imported.metadata.deps_analyzed.is_none());
    }

    #[tokio::test]
    async fn unknown_and_self_edges_rejected() {
        let (_dir, store) = create_temp_store();
        ready_task(&store, "task-a", "A");
        ready_task(&store, "task-b", "B");

        let stub = EdgeStub::new(vec![
            edge("task-a", "task-a"),
            edge("task-ghost", "task-b"),
            edge("task-a", "task-ghost"),
        ]);

        let applied = analyze_dependencies(&store, &stub).await.unwrap();
        assert_eq!(applied, 0);
        let a = store.tasks.get("task-a").unwrap().unwrap();
        assert!(a.blocks.is_empty());
        assert!(a.blocked_by.is_empty());
    }

    #[test]
    fn has_cycle_detects_transitive_paths() {
        let mut adj: HashMap<String, Vec<String>> = HashMap::new();
        adj.insert("a".into(), vec!["b".into()]);
        adj.insert("b".into(), vec!["c".into()]);

        // c -> a would close a cycle because a reaches c.
        assert!(has_cycle(&adj, "c", "a"));
        // a -> c is fine (parallel to the existing path).
        assert!(!has_cycle(&adj, "a", "c"));
    }
}
