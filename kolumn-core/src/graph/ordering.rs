//! Ordering - Execution batches, dependency levels and the critical path

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use super::{DependencyGraph, GraphError, GraphResult};

/// Resources with no dependency relationship among them, safe to apply concurrently
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionBatch {
    /// Zero-based position in the execution order
    pub level: usize,
    /// Resource IDs, sorted lexicographically
    pub resources: Vec<String>,
}

/// Longest prerequisite chain in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct CriticalPath {
    /// Resources in apply order: first prerequisite to final dependent
    pub resources: Vec<String>,
}

impl CriticalPath {
    /// Number of edges along the path
    pub fn length(&self) -> usize {
        self.resources.len().saturating_sub(1)
    }
}

impl DependencyGraph {
    /// Batches covering every resource in the graph
    pub fn execution_batches(&self) -> GraphResult<Vec<ExecutionBatch>> {
        let all: BTreeSet<&str> = self.nodes.keys().map(String::as_str).collect();
        self.batches_within(&all)
    }

    /// Batches for a subset of resources, considering only the edges between them.
    ///
    /// Fails with [`GraphError::CycleDetected`] (and returns no batches) when
    /// the subset contains a cycle.
    pub fn execution_order<S: AsRef<str>>(&self, ids: &[S]) -> GraphResult<Vec<ExecutionBatch>> {
        let mut members = BTreeSet::new();
        for id in ids {
            let id = id.as_ref();
            match self.nodes.get_key_value(id) {
                Some((key, _)) => {
                    members.insert(key.as_str());
                }
                None => return Err(GraphError::UnknownResource(id.to_string())),
            }
        }

        if let Some(cycle) = self.cycles_within(&members).into_iter().next() {
            return Err(GraphError::CycleDetected { cycle });
        }

        self.batches_within(&members)
    }

    /// Level (batch index) of every resource
    pub fn dependency_levels(&self) -> GraphResult<BTreeMap<String, usize>> {
        let mut levels = BTreeMap::new();
        for batch in self.execution_batches()? {
            for id in batch.resources {
                levels.insert(id, batch.level);
            }
        }
        Ok(levels)
    }

    /// Longest chain of prerequisites. Ties resolve to the lexicographically
    /// smallest resource IDs.
    pub fn critical_path(&self) -> GraphResult<CriticalPath> {
        let batches = self.execution_batches()?;

        let mut longest: HashMap<&str, usize> = HashMap::new();
        let mut previous: HashMap<&str, &str> = HashMap::new();

        for batch in &batches {
            for id in &batch.resources {
                let (node, _) = match self.nodes.get_key_value(id.as_str()) {
                    Some(entry) => entry,
                    None => continue,
                };
                let mut best = 0;
                for prerequisite in self.dependencies_of(node) {
                    let candidate = longest.get(prerequisite).copied().unwrap_or(0) + 1;
                    if candidate > best {
                        best = candidate;
                        previous.insert(node.as_str(), prerequisite);
                    }
                }
                longest.insert(node.as_str(), best);
            }
        }

        let mut end: Option<(&str, usize)> = None;
        for id in self.nodes.keys() {
            let length = longest.get(id.as_str()).copied().unwrap_or(0);
            if end.is_none_or(|(_, best)| length > best) {
                end = Some((id.as_str(), length));
            }
        }

        let Some((mut cursor, _)) = end else {
            return Ok(CriticalPath::default());
        };

        let mut resources = vec![cursor.to_string()];
        while let Some(&prev) = previous.get(cursor) {
            resources.push(prev.to_string());
            cursor = prev;
        }
        resources.reverse();

        Ok(CriticalPath { resources })
    }

    /// Kahn's algorithm over a member set: repeatedly take every member whose
    /// prerequisites (within the set) are all applied.
    fn batches_within<'a>(
        &'a self,
        members: &BTreeSet<&'a str>,
    ) -> GraphResult<Vec<ExecutionBatch>> {
        let mut pending: BTreeMap<&str, usize> = members
            .iter()
            .map(|id| {
                let degree = self
                    .dependencies_of(id)
                    .into_iter()
                    .filter(|d| members.contains(d))
                    .count();
                (*id, degree)
            })
            .collect();

        let mut batches = Vec::new();
        while !pending.is_empty() {
            let ready: Vec<&str> = pending
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(id, _)| *id)
                .collect();

            if ready.is_empty() {
                let blocked: BTreeSet<&str> = pending.keys().copied().collect();
                let cycle = self
                    .cycles_within(&blocked)
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| blocked.iter().map(|s| s.to_string()).collect());
                return Err(GraphError::CycleDetected { cycle });
            }

            for id in &ready {
                pending.remove(id);
                for dependent in self.dependents_of(id) {
                    if let Some(degree) = pending.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            batches.push(ExecutionBatch {
                level: batches.len(),
                resources: ready.into_iter().map(String::from).collect(),
            });
        }

        Ok(batches)
    }
}
