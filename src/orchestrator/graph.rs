//! Task dependency graph.
//!
//! Tracks forward edges (a task's unresolved dependencies) and reverse
//! edges (its dependents), maintains the ready set, and propagates
//! failure to transitive dependents. Batches containing a cycle are
//! rejected with the offending edges. Not thread-safe on its own; the
//! orchestrator serializes access.

use crate::models::Task;
use crate::{HephaestusError, Result};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Default)]
pub struct DependencyGraph {
    /// task id -> dependencies not yet succeeded.
    pending_deps: HashMap<String, HashSet<String>>,
    /// task id -> tasks depending on it.
    dependents: HashMap<String, HashSet<String>>,
    /// Tasks whose dependencies have all succeeded and which have not
    /// been handed to the executor yet.
    ready: HashSet<String>,
    known: HashSet<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch. Dependencies must reference ids within the
    /// batch; cycles are rejected with the edges that close them.
    /// Returns the ids that are immediately ready.
    pub fn register_batch(&mut self, tasks: &[Task]) -> Result<Vec<String>> {
        let batch_ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        if batch_ids.len() != tasks.len() {
            return Err(HephaestusError::Validation(
                "duplicate task ids in batch".to_string(),
            ));
        }

        for task in tasks {
            if self.known.contains(&task.id) {
                return Err(HephaestusError::Validation(format!(
                    "task {} is already registered",
                    task.id
                )));
            }
            for dep in &task.dependencies {
                if !batch_ids.contains(dep.as_str()) {
                    return Err(HephaestusError::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
                if dep == &task.id {
                    return Err(HephaestusError::Validation(format!(
                        "task {} depends on itself",
                        task.id
                    )));
                }
            }
        }

        Self::reject_cycles(tasks)?;

        let mut ready = Vec::new();
        for task in tasks {
            self.known.insert(task.id.clone());
            let deps: HashSet<String> = task.dependencies.iter().cloned().collect();
            for dep in &deps {
                self.dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(task.id.clone());
            }
            if deps.is_empty() {
                self.ready.insert(task.id.clone());
                ready.push(task.id.clone());
            } else {
                self.pending_deps.insert(task.id.clone(), deps);
            }
        }
        Ok(ready)
    }

    /// Record a success. Returns the resolved edges `(from, to)` and the
    /// ids that became ready.
    pub fn on_success(&mut self, id: &str) -> (Vec<(String, String)>, Vec<String>) {
        self.ready.remove(id);
        let mut resolved = Vec::new();
        let mut newly_ready = Vec::new();

        let dependents = self.dependents.remove(id).unwrap_or_default();
        for dependent in dependents {
            // A dependent that was cancelled out of the graph no longer
            // has a pending entry; it resolves nothing.
            if let Some(deps) = self.pending_deps.get_mut(&dependent) {
                deps.remove(id);
                resolved.push((id.to_string(), dependent.clone()));
                if deps.is_empty() {
                    self.pending_deps.remove(&dependent);
                    self.ready.insert(dependent.clone());
                    newly_ready.push(dependent);
                }
            }
        }
        (resolved, newly_ready)
    }

    /// Record a failure or cancellation. Every transitive dependent is
    /// removed from the graph and returned for cancellation.
    pub fn on_failure(&mut self, id: &str) -> Vec<String> {
        self.ready.remove(id);
        let mut cancelled = Vec::new();
        let mut frontier: VecDeque<String> = VecDeque::new();
        frontier.push_back(id.to_string());

        while let Some(current) = frontier.pop_front() {
            let dependents = self.dependents.remove(&current).unwrap_or_default();
            for dependent in dependents {
                if self.pending_deps.remove(&dependent).is_some()
                    || self.ready.remove(&dependent)
                {
                    cancelled.push(dependent.clone());
                    frontier.push_back(dependent);
                }
            }
        }
        cancelled
    }

    /// A ready task was handed to the executor; it leaves the ready set.
    pub fn mark_started(&mut self, id: &str) {
        self.ready.remove(id);
    }

    /// Drop bookkeeping for a task that reached a terminal state outside
    /// the success/failure paths (direct cancellation).
    pub fn remove(&mut self, id: &str) {
        self.ready.remove(id);
        self.pending_deps.remove(id);
    }

    /// Forget a task entirely; used by retention cleanup so ids can be
    /// reused after their records are trimmed.
    pub fn forget(&mut self, id: &str) {
        self.known.remove(id);
        self.ready.remove(id);
        self.pending_deps.remove(id);
        self.dependents.remove(id);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.ready.contains(id)
    }

    /// Kahn's algorithm over the batch; anything left unprocessed sits
    /// on a cycle, and its remaining edges are reported.
    fn reject_cycles(tasks: &[Task]) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in tasks {
            in_degree.entry(task.id.as_str()).or_insert(0);
            for dep in &task.dependencies {
                *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
                edges.entry(dep.as_str()).or_default().push(task.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for next in edges.get(id).map(|v| v.as_slice()).unwrap_or(&[]) {
                let degree = in_degree.get_mut(next).expect("edge target in batch");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        if processed == tasks.len() {
            return Ok(());
        }

        let stuck: HashSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        let mut offending = Vec::new();
        for task in tasks {
            if stuck.contains(task.id.as_str()) {
                for dep in &task.dependencies {
                    if stuck.contains(dep.as_str()) {
                        offending.push(format!("{} -> {}", dep, task.id));
                    }
                }
            }
        }
        offending.sort();
        Err(HephaestusError::Validation(format!(
            "dependency cycle detected: {}",
            offending.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentClass;
    use serde_json::json;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(AgentClass::Scribe, json!(null));
        t.id = id.to_string();
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn tasks_without_deps_are_immediately_ready() {
        let mut graph = DependencyGraph::new();
        let ready = graph
            .register_batch(&[task("a", &[]), task("b", &["a"])])
            .unwrap();
        assert_eq!(ready, vec!["a".to_string()]);
        assert_eq!(graph.ready_len(), 1);
    }

    #[test]
    fn success_resolves_edges_and_readies_dependents() {
        let mut graph = DependencyGraph::new();
        graph
            .register_batch(&[task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])])
            .unwrap();

        let (resolved, ready) = graph.on_success("a");
        assert!(resolved.contains(&("a".to_string(), "b".to_string())));
        assert!(resolved.contains(&("a".to_string(), "c".to_string())));
        assert_eq!(ready, vec!["b".to_string()]);

        let (_, ready) = graph.on_success("b");
        assert_eq!(ready, vec!["c".to_string()]);
    }

    #[test]
    fn fan_in_waits_for_all_dependencies() {
        let mut graph = DependencyGraph::new();
        graph
            .register_batch(&[
                task("a", &[]),
                task("b", &[]),
                task("e", &["a", "b"]),
            ])
            .unwrap();

        let (_, ready) = graph.on_success("a");
        assert!(ready.is_empty());
        let (_, ready) = graph.on_success("b");
        assert_eq!(ready, vec!["e".to_string()]);
    }

    #[test]
    fn failure_cancels_transitive_dependents() {
        let mut graph = DependencyGraph::new();
        graph
            .register_batch(&[
                task("a", &[]),
                task("b", &["a"]),
                task("c", &["b"]),
                task("d", &[]),
            ])
            .unwrap();

        let cancelled = graph.on_failure("a");
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&"b".to_string()));
        assert!(cancelled.contains(&"c".to_string()));
        // Unrelated task unaffected.
        assert!(graph.is_ready("d"));
    }

    #[test]
    fn cycle_is_rejected_with_offending_edges() {
        let mut graph = DependencyGraph::new();
        let result = graph.register_batch(&[
            task("a", &["c"]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("free", &[]),
        ]);

        match result {
            Err(HephaestusError::Validation(msg)) => {
                assert!(msg.contains("cycle"));
                assert!(msg.contains("a -> b"));
                assert!(msg.contains("b -> c"));
                assert!(msg.contains("c -> a"));
            }
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut graph = DependencyGraph::new();
        let result = graph.register_batch(&[task("a", &["a"])]);
        assert!(matches!(result, Err(HephaestusError::Validation(_))));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut graph = DependencyGraph::new();
        let result = graph.register_batch(&[task("a", &["ghost"])]);
        assert!(matches!(result, Err(HephaestusError::Validation(_))));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut graph = DependencyGraph::new();
        let result = graph.register_batch(&[task("a", &[]), task("a", &[])]);
        assert!(matches!(result, Err(HephaestusError::Validation(_))));
    }

    #[test]
    fn already_succeeded_dependency_does_not_block_later_batches() {
        let mut graph = DependencyGraph::new();
        graph.register_batch(&[task("a", &[])]).unwrap();
        graph.on_success("a");

        // A new batch may reuse the graph, ids must be fresh.
        let ready = graph.register_batch(&[task("x", &[])]).unwrap();
        assert_eq!(ready, vec!["x".to_string()]);
    }
}
