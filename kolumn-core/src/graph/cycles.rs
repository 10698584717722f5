//! Cycle detection
//!
//! Depth-first search with an explicit stack and an on-stack set, so deep
//! dependency chains never exhaust the call stack.

use std::collections::{BTreeSet, HashSet};

use super::DependencyGraph;

struct Frame<'a> {
    node: &'a str,
    neighbors: Vec<&'a str>,
    cursor: usize,
}

impl DependencyGraph {
    /// All distinct cycles reachable by a depth-first walk, in discovery order.
    ///
    /// Each cycle is the ordered list of resources along the back edge, e.g.
    /// `[a, b, c]` for `a -> b -> c -> a`.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let all: BTreeSet<&str> = self.nodes.keys().map(String::as_str).collect();
        self.cycles_within(&all)
    }

    /// The first cycle found, if any
    pub fn first_cycle(&self) -> Option<Vec<String>> {
        self.find_cycles().into_iter().next()
    }

    pub fn has_cycle(&self) -> bool {
        self.first_cycle().is_some()
    }

    /// Cycles restricted to the given members; edges leaving the set are ignored
    pub(crate) fn cycles_within<'a>(&'a self, members: &BTreeSet<&'a str>) -> Vec<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut cycles = Vec::new();

        for &start in members {
            if visited.contains(start) {
                continue;
            }

            visited.insert(start);
            on_stack.insert(start);
            let mut stack = vec![Frame {
                node: start,
                neighbors: self.neighbors_within(start, members),
                cursor: 0,
            }];

            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                let node = frame.node;
                let next = frame.neighbors.get(frame.cursor).copied();
                frame.cursor += 1;

                match next {
                    Some(next) if on_stack.contains(next) => {
                        if let Some(pos) = stack.iter().position(|f| f.node == next) {
                            let cycle: Vec<String> =
                                stack[pos..].iter().map(|f| f.node.to_string()).collect();
                            if seen.insert(normalize(&cycle)) {
                                cycles.push(cycle);
                            }
                        }
                    }
                    Some(next) => {
                        if visited.insert(next) {
                            on_stack.insert(next);
                            stack.push(Frame {
                                node: next,
                                neighbors: self.neighbors_within(next, members),
                                cursor: 0,
                            });
                        }
                    }
                    None => {
                        on_stack.remove(node);
                        stack.pop();
                    }
                }
            }
        }

        cycles
    }

    fn neighbors_within<'a>(&'a self, node: &str, members: &BTreeSet<&'a str>) -> Vec<&'a str> {
        self.requires
            .get(node)
            .map(|set| {
                set.iter()
                    .map(String::as_str)
                    .filter(|n| members.contains(n))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Rotate a cycle so its smallest member comes first
fn normalize(cycle: &[String]) -> Vec<String> {
    let pivot = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map_or(0, |(i, _)| i);
    cycle[pivot..]
        .iter()
        .chain(cycle[..pivot].iter())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{id, res};
    use crate::graph::GraphNode;
    use crate::resource::DependencyKind;

    #[test]
    fn three_node_cycle_is_reported_once() {
        let resources = vec![
            res("a", &["pg.table.b"]),
            res("b", &["pg.table.c"]),
            res("c", &["pg.table.a"]),
        ];
        let graph = DependencyGraph::build(&resources, &[]);

        let cycles = graph.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec![id("a"), id("b"), id("c")]);
        assert!(graph.has_cycle());
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let resources = vec![
            res("a", &[]),
            res("b", &["pg.table.a"]),
            res("c", &["pg.table.a", "pg.table.b"]),
        ];
        let graph = DependencyGraph::build(&resources, &[]);
        assert!(graph.find_cycles().is_empty());
        assert!(graph.first_cycle().is_none());
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = DependencyGraph::build(&[res("a", &["pg.table.a"])], &[]);
        assert_eq!(graph.find_cycles(), vec![vec![id("a")]]);
    }

    #[test]
    fn independent_cycles_are_all_found() {
        let resources = vec![
            res("a", &["pg.table.b"]),
            res("b", &["pg.table.a"]),
            res("x", &["pg.table.y"]),
            res("y", &["pg.table.x"]),
        ];
        let graph = DependencyGraph::build(&resources, &[]);
        assert_eq!(graph.find_cycles().len(), 2);
    }

    #[test]
    fn long_chain_does_not_overflow() {
        let mut graph = DependencyGraph::new();
        let count = 50_000;
        for i in 0..count {
            graph.add_node(GraphNode {
                id: format!("n{i}"),
                provider: "p".to_string(),
                resource_type: "t".to_string(),
                name: format!("n{i}"),
            });
        }
        for i in 1..count {
            graph.add_edge(
                &format!("n{i}"),
                &format!("n{}", i - 1),
                DependencyKind::Explicit,
                false,
            );
        }
        assert!(!graph.has_cycle());

        graph.add_edge("n0", &format!("n{}", count - 1), DependencyKind::Explicit, false);
        let cycle = graph.first_cycle().unwrap();
        assert_eq!(cycle.len(), count);
    }

    #[test]
    fn normalize_rotates_to_smallest() {
        let cycle = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(normalize(&cycle), vec!["a", "b", "c"]);
    }
}
