//! Dependency graph over the tasks of one work item.
//!
//! [`DependencyGraph::build`] is all-or-nothing: it validates every edge,
//! rejects cycles (naming the tasks on the cycle) and computes each task's
//! level in a single topological pass. The graph is immutable afterwards; a
//! work item that needs re-planning builds a new one.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::task::{TaskId, TaskNode};
use crate::error::{Error, Result};

/// A dependency edge: `dependent` cannot start before `prerequisite` completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub prerequisite: TaskId,
    pub dependent: TaskId,
}

impl Dependency {
    pub fn new(dependent: impl Into<TaskId>, prerequisite: impl Into<TaskId>) -> Self {
        Self {
            prerequisite: prerequisite.into(),
            dependent: dependent.into(),
        }
    }
}

/// The validated task DAG.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
pub struct DependencyGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Level per node, indexed by `NodeIndex::index()`.
    levels: Vec<usize>,
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build a graph from nodes plus explicit edges.
    ///
    /// Edges implied by each node's `depends_on` are added as well, and after
    /// construction every node's `depends_on` lists exactly its incoming edges.
    ///
    /// # Errors
    /// - [`Error::Validation`] for duplicate task ids
    /// - [`Error::UnknownTask`] for an edge naming a missing task
    /// - [`Error::DependencyCycle`] when the edges form a cycle
    pub fn build(nodes: Vec<TaskNode>, edges: Vec<Dependency>) -> Result<Self> {
        let mut graph: DiGraph<TaskNode, ()> = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if index.contains_key(&node.id) {
                return Err(Error::Validation(format!("duplicate task id: {}", node.id)));
            }
            let id = node.id.clone();
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }

        let implied: Vec<Dependency> = graph
            .node_weights()
            .flat_map(|node| {
                node.depends_on
                    .iter()
                    .map(|dep| Dependency::new(node.id.clone(), dep.clone()))
            })
            .collect();

        for edge in implied.iter().chain(edges.iter()) {
            let from = *index
                .get(&edge.prerequisite)
                .ok_or_else(|| Error::UnknownTask(edge.prerequisite.clone()))?;
            let to = *index
                .get(&edge.dependent)
                .ok_or_else(|| Error::UnknownTask(edge.dependent.clone()))?;
            graph.update_edge(from, to, ());
        }

        if let Some(cycle) = find_cycle(&graph) {
            let cycle: Vec<TaskId> = cycle.into_iter().map(|i| graph[i].id.clone()).collect();
            return Err(Error::DependencyCycle { cycle });
        }

        // Acyclic at this point; toposort cannot fail.
        let order = toposort(&graph, None).map_err(|c| Error::DependencyCycle {
            cycle: vec![graph[c.node_id()].id.clone()],
        })?;

        let mut levels = vec![0usize; graph.node_count()];
        for &idx in &order {
            let level = graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|pred| levels[pred.index()] + 1)
                .max()
                .unwrap_or(0);
            levels[idx.index()] = level;
        }

        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for idx in indices {
            let deps: BTreeSet<TaskId> = graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|pred| graph[pred].id.clone())
                .collect();
            graph[idx].depends_on = deps;
        }

        Ok(Self {
            graph,
            index,
            levels,
            order,
        })
    }

    /// Build a graph using only each node's `depends_on` set.
    pub fn from_nodes(nodes: Vec<TaskNode>) -> Result<Self> {
        Self::build(nodes, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// All tasks in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Length of the longest dependency chain ending at `id`.
    pub fn level(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).map(|idx| self.levels[idx.index()])
    }

    pub fn max_level(&self) -> Option<usize> {
        self.levels.iter().copied().max()
    }

    pub fn nodes_at_level(&self, level: usize) -> Vec<&TaskNode> {
        self.graph
            .node_indices()
            .filter(|idx| self.levels[idx.index()] == level)
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Tasks `id` depends on directly.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id` directly.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Tasks ordered so that every task comes after its dependencies.
    pub fn topological_order(&self) -> Vec<&TaskNode> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<&TaskNode> {
        match self.index.get(id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, dir)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("task_count", &self.len())
            .field("edge_count", &self.edge_count())
            .field("max_level", &self.max_level())
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Iterative three-color DFS. Returns the nodes of the first cycle found, in
/// edge order, or `None` if the graph is acyclic.
fn find_cycle(graph: &DiGraph<TaskNode, ()>) -> Option<Vec<NodeIndex>> {
    let mut color = vec![Color::White; graph.node_count()];
    let successors = |idx: NodeIndex| -> Vec<NodeIndex> {
        let mut succ: Vec<NodeIndex> = graph.neighbors(idx).collect();
        succ.sort();
        succ
    };

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }
        color[start.index()] = Color::Gray;
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = vec![(start, successors(start), 0)];

        loop {
            let Some(frame) = stack.last_mut() else {
                break;
            };
            if frame.2 < frame.1.len() {
                let next = frame.1[frame.2];
                frame.2 += 1;
                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        stack.push((next, successors(next), 0));
                    }
                    Color::Gray => {
                        let from = stack.iter().position(|(n, _, _)| *n == next).unwrap_or(0);
                        return Some(stack[from..].iter().map(|(n, _, _)| *n).collect());
                    }
                    Color::Black => {}
                }
            } else {
                let node = frame.0;
                color[node.index()] = Color::Black;
                stack.pop();
            }
        }
    }
    None
}
