// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dependency graph (§4.3): builds a DAG from `depends_on`, validates
//! it, and exposes `ready`/`layers` queries. Built with `petgraph`, the
//! teacher workspace's graph-processing crate.

use crate::workflow::{Step, StepOrBlock};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// A validated, acyclic dependency graph over a workflow's top-level steps.
#[derive(Clone)]
pub struct Graph {
    graph: DiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    /// Declaration order, used to break layering ties deterministically
    /// (§4.3: "tie-breaks by declaration order so that test expectations
    /// are stable").
    order: HashMap<String, usize>,
}

impl Graph {
    /// Builds the DAG from `steps` (§4.3: `build(steps) -> Graph |
    /// CycleError | UnknownDependencyError`).
    pub fn build(steps: &[Step]) -> Result<Self, String> {
        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();
        let mut order = HashMap::new();

        for (i, step) in steps.iter().enumerate() {
            let idx = graph.add_node(step.name.clone());
            index_of.insert(step.name.clone(), idx);
            order.insert(step.name.clone(), i);
        }

        for step in steps {
            for dep in &step.depends_on {
                let dep_idx = index_of
                    .get(dep)
                    .ok_or_else(|| format!("unknown dependency '{dep}' for step '{}'", step.name))?;
                let step_idx = index_of[&step.name];
                graph.add_edge(*dep_idx, step_idx, ());
            }
        }

        if petgraph::algo::toposort(&graph, None).is_err() {
            let cycle = find_cycle(steps).unwrap_or_else(|| "<cycle>".to_string());
            return Err(cycle);
        }

        Ok(Self {
            graph,
            index_of,
            order,
        })
    }

    /// Names whose predecessors are all in `completed` and which are not
    /// themselves in `completed` (§4.3).
    pub fn ready(&self, completed: &HashSet<String>) -> HashSet<String> {
        self.graph
            .node_indices()
            .filter_map(|idx| {
                let name = &self.graph[idx];
                if completed.contains(name) {
                    return None;
                }
                let all_deps_done = self
                    .graph
                    .edges_directed(idx, petgraph::Direction::Incoming)
                    .all(|e| completed.contains(&self.graph[e.source()]));
                all_deps_done.then(|| name.clone())
            })
            .collect()
    }

    /// A topological layering: layer `i+1` contains only names whose
    /// predecessors all lie in layers `0..i` (§4.3, Kahn's algorithm).
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .edges_directed(idx, petgraph::Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut layers = Vec::new();
        let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let mut frontier: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|idx| in_degree[idx] == 0)
                .collect();
            frontier.sort_by_key(|idx| self.order[&self.graph[*idx]]);

            let layer: Vec<String> = frontier.iter().map(|idx| self.graph[*idx].clone()).collect();
            for idx in &frontier {
                remaining.remove(idx);
                for edge in self.graph.edges_directed(*idx, petgraph::Direction::Outgoing) {
                    *in_degree.get_mut(&edge.target()).unwrap() -= 1;
                }
            }
            layers.push(layer);
        }

        layers
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Standalone cycle check used by [`crate::workflow::Workflow`] validation,
/// before a [`Graph`] is constructed. Uses DFS with white/gray/black color
/// marking (§4.3) and reports the sequence of names on the detected back
/// edge.
pub fn detect_cycle(entries: &[StepOrBlock]) -> Result<(), String> {
    let steps: Vec<&Step> = entries
        .iter()
        .filter_map(|e| match e {
            StepOrBlock::Step(s) => Some(s),
            StepOrBlock::Parallel { .. } => None,
        })
        .collect();
    find_cycle(&steps.iter().map(|s| (*s).clone()).collect::<Vec<_>>())
        .map_or(Ok(()), Err)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

fn find_cycle(steps: &[Step]) -> Option<String> {
    let adjacency: HashMap<&str, &HashSet<String>> = steps
        .iter()
        .map(|s| (s.name.as_str(), &s.depends_on))
        .collect();
    // Edge direction for DFS purposes: a depends on b means b must run
    // first, so we walk from dependents to dependencies; a cycle is
    // reported in that same "depends_on" order.
    let mut colors: HashMap<&str, Color> = steps.iter().map(|s| (s.name.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    for step in steps {
        if colors[step.name.as_str()] == Color::White {
            if let Some(cycle) = visit(step.name.as_str(), &adjacency, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, &'a HashSet<String>>,
    colors: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
) -> Option<String> {
    colors.insert(node, Color::Gray);
    stack.push(node);

    if let Some(deps) = adjacency.get(node) {
        for dep in deps.iter() {
            let dep = dep.as_str();
            if !adjacency.contains_key(dep) {
                continue;
            }
            match colors.get(dep).copied().unwrap_or(Color::White) {
                Color::White => {
                    if let Some(cycle) = visit(dep, adjacency, colors, stack) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<&str> = stack[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle.join(" -> "));
                }
                Color::Black => {}
            }
        }
    }

    stack.pop();
    colors.insert(node, Color::Black);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepFailurePolicy;
    use std::collections::HashMap as Map;

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            command: "echo".to_string(),
            params: Map::new(),
            condition: None,
            on_failure: StepFailurePolicy::Fail,
            retries: 0,
            timeout_seconds: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn layers_respect_dag_structure() {
        // checkout -> build-a, build-b -> deploy (S4)
        let steps = vec![
            step("checkout", &[]),
            step("build-a", &["checkout"]),
            step("build-b", &["checkout"]),
            step("deploy", &["build-a", "build-b"]),
        ];
        let graph = Graph::build(&steps).unwrap();
        let layers = graph.layers();
        assert_eq!(layers[0], vec!["checkout"]);
        assert_eq!(layers[1].len(), 2);
        assert!(layers[1].contains(&"build-a".to_string()));
        assert!(layers[1].contains(&"build-b".to_string()));
        assert_eq!(layers[2], vec!["deploy"]);
    }

    #[test]
    fn ready_set_tracks_completion() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let graph = Graph::build(&steps).unwrap();
        let none_done: HashSet<String> = HashSet::new();
        assert_eq!(graph.ready(&none_done), ["a".to_string()].into_iter().collect());

        let mut done = HashSet::new();
        done.insert("a".to_string());
        assert_eq!(graph.ready(&done), ["b".to_string()].into_iter().collect());
    }

    #[test]
    fn detects_cycle() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(Graph::build(&steps).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let steps = vec![step("a", &["missing"])];
        assert!(Graph::build(&steps).is_err());
    }
}
