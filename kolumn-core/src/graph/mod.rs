//! Graph - Dependency graph over managed resources
//!
//! The graph is a derived, per-call view over a state's resources and
//! dependency records. An edge `from -> to` means `from` requires `to`, so
//! `to` must be applied first.
//!
//! Edges come from three sources:
//! - explicit [`Dependency`] records stored in the state
//! - each resource's `depends_on` list
//! - typed [`ResourceReference`](crate::resource::ResourceReference)s
//!
//! Edges pointing at resources that do not exist are never dropped silently;
//! they are kept in [`DependencyGraph::missing_dependencies`].

mod cycles;
mod impact;
mod ordering;

pub use impact::{ChangeKind, Impact, ImpactKind, ImpactReport, ImpactSeverity};
pub use ordering::{CriticalPath, ExecutionBatch};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Serialize;
use thiserror::Error;

use crate::resource::{Dependency, DependencyKind, Resource};

/// Errors produced by graph analysis
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A cycle blocks an ordering request
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<String> },

    /// A requested resource is not part of the graph
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// A dependency points at a resource that does not exist
    #[error("Missing dependency: {from} requires {to}, which does not exist")]
    MissingDependency { from: String, to: String },
}

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Render a cycle as `a -> b -> c -> a`
pub fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => {
            let mut parts: Vec<&str> = cycle.iter().map(String::as_str).collect();
            parts.push(first);
            parts.join(" -> ")
        }
        None => String::new(),
    }
}

/// A resource in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub provider: String,
    pub resource_type: String,
    pub name: String,
}

impl GraphNode {
    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            id: resource.id(),
            provider: resource.provider.clone(),
            resource_type: resource.resource_type.clone(),
            name: resource.name.clone(),
        }
    }
}

/// An edge between two existing resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
    pub optional: bool,
}

/// A dependency whose endpoint does not resolve to a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
    pub optional: bool,
}

/// Summary counters for a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphStatistics {
    pub nodes: usize,
    pub edges: usize,
    pub missing: usize,
    pub orphans: usize,
    pub roots: usize,
    pub leaves: usize,
    pub cycles: usize,
    /// Number of execution batches, `None` when the graph is cyclic
    pub depth: Option<usize>,
}

/// Result of validating the dependencies of a single resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyValidation {
    pub resource: String,
    pub missing: Vec<MissingDependency>,
    pub cycles: Vec<Vec<String>>,
}

impl DependencyValidation {
    /// Valid when no required dependency is missing and no cycle passes through the resource
    pub fn is_valid(&self) -> bool {
        self.cycles.is_empty() && self.missing.iter().all(|m| m.optional)
    }
}

/// Directed dependency graph
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    /// Resource -> resources it requires
    requires: BTreeMap<String, BTreeSet<String>>,
    /// Resource -> resources that require it
    required_by: BTreeMap<String, BTreeSet<String>>,
    missing: Vec<MissingDependency>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a state's resources and dependency records
    pub fn build(resources: &[Resource], dependencies: &[Dependency]) -> Self {
        let mut graph = Self::new();

        for resource in resources {
            graph.add_node(GraphNode::from_resource(resource));
        }

        for dependency in dependencies {
            graph.add_edge(
                &dependency.from,
                &dependency.to,
                dependency.kind,
                dependency.optional,
            );
        }

        for resource in resources {
            let id = resource.id();
            for target in &resource.depends_on {
                graph.add_edge(&id, target, DependencyKind::Explicit, false);
            }
            for reference in &resource.references {
                graph.add_edge(&id, &reference.target, reference.kind, false);
            }
        }

        log::debug!(
            "Built dependency graph: {} nodes, {} edges, {} missing",
            graph.nodes.len(),
            graph.edges.len(),
            graph.missing.len()
        );

        graph
    }

    /// Add a node. An existing node with the same ID is kept.
    pub fn add_node(&mut self, node: GraphNode) {
        if self.nodes.contains_key(&node.id) {
            log::warn!("Duplicate resource ID in graph: {}", node.id);
            return;
        }
        self.nodes.insert(node.id.clone(), node);
    }

    /// Add a dependency edge. Duplicate edges are merged; edges to or from
    /// unknown resources are recorded as missing.
    pub fn add_edge(&mut self, from: &str, to: &str, kind: DependencyKind, optional: bool) {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            let missing = MissingDependency {
                from: from.to_string(),
                to: to.to_string(),
                kind,
                optional,
            };
            if !self.missing.contains(&missing) {
                self.missing.push(missing);
            }
            return;
        }

        let inserted = self
            .requires
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        if !inserted {
            return;
        }
        self.required_by
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        self.edges.push(GraphEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            optional,
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn missing_dependencies(&self) -> &[MissingDependency] {
        &self.missing
    }

    /// Resources that `id` requires directly, in sorted order
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.requires
            .get(id)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Resources that require `id` directly, in sorted order
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.required_by
            .get(id)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn out_degree(&self, id: &str) -> usize {
        self.requires.get(id).map_or(0, BTreeSet::len)
    }

    fn in_degree(&self, id: &str) -> usize {
        self.required_by.get(id).map_or(0, BTreeSet::len)
    }

    /// Resources with no edges in either direction
    pub fn orphans(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.out_degree(id) == 0 && self.in_degree(id) == 0)
            .cloned()
            .collect()
    }

    /// Resources that require nothing
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.out_degree(id) == 0)
            .cloned()
            .collect()
    }

    /// Resources nothing depends on
    pub fn leaves(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.in_degree(id) == 0)
            .cloned()
            .collect()
    }

    /// Shortest requires-chain from `from` to `to`, both ends included
    pub fn path_between(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }

        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        parent.insert(from, from);

        while let Some(current) = queue.pop_front() {
            for next in self.dependencies_of(current) {
                if parent.contains_key(next) {
                    continue;
                }
                parent.insert(next, current);
                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = to;
                    while cursor != from {
                        cursor = parent[cursor];
                        path.push(cursor.to_string());
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// True when `from` requires `to` directly or through other resources
    pub fn depends_on_transitively(&self, from: &str, to: &str) -> bool {
        from != to && self.path_between(from, to).is_some()
    }

    /// Check that adding `from -> to` would keep the graph acyclic
    pub fn check_new_dependency(&self, from: &str, to: &str) -> GraphResult<()> {
        for id in [from, to] {
            if !self.contains(id) {
                return Err(GraphError::UnknownResource(id.to_string()));
            }
        }

        if from == to {
            return Err(GraphError::CycleDetected {
                cycle: vec![from.to_string()],
            });
        }

        if let Some(path) = self.path_between(to, from) {
            // from -> to -> ... -> from
            let mut cycle = vec![from.to_string()];
            cycle.extend(path.into_iter().take_while(|id| id != from));
            return Err(GraphError::CycleDetected { cycle });
        }

        Ok(())
    }

    /// Validate every dependency declared by one resource
    pub fn validate_resource(&self, id: &str) -> GraphResult<DependencyValidation> {
        if !self.contains(id) {
            return Err(GraphError::UnknownResource(id.to_string()));
        }

        let missing = self
            .missing
            .iter()
            .filter(|m| m.from == id)
            .cloned()
            .collect();

        let mut cycles = Vec::new();
        for prerequisite in self.dependencies_of(id) {
            if prerequisite == id {
                cycles.push(vec![id.to_string()]);
                continue;
            }
            if let Some(path) = self.path_between(prerequisite, id) {
                let mut cycle = vec![id.to_string()];
                cycle.extend(path.into_iter().take_while(|step| step != id));
                cycles.push(cycle);
            }
        }

        Ok(DependencyValidation {
            resource: id.to_string(),
            missing,
            cycles,
        })
    }

    pub fn statistics(&self) -> GraphStatistics {
        let cycles = self.find_cycles().len();
        GraphStatistics {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
            missing: self.missing.len(),
            orphans: self.orphans().len(),
            roots: self.roots().len(),
            leaves: self.leaves().len(),
            cycles,
            depth: self.execution_batches().ok().map(|b| b.len()),
        }
    }
}
