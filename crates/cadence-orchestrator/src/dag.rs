//! Subtasks and their dependency graph.
//!
//! Provides DAG construction for a phase's subtasks, including duplicate and
//! dangling-reference checks, cycle detection and readiness bookkeeping for
//! the coordinator's dynamic scheduler.

use crate::agents::AgentRole;
use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A unit of decomposed work, consumed by exactly one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique key within the phase.
    pub key: String,
    /// What the agent should do.
    pub description: String,
    /// Role that executes it.
    pub role: AgentRole,
    /// Keys of subtasks that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Subtask {
    /// Creates a subtask with no dependencies.
    pub fn new(key: impl Into<String>, role: AgentRole, description: impl Into<String>) -> Self {
        Self { key: key.into(), description: description.into(), role, depends_on: Vec::new() }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn after(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }
}

/// Errors that can occur while building a subtask graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DagError {
    /// Two subtasks share a key.
    #[error("duplicate subtask key: {0}")]
    DuplicateKey(String),

    /// A dependency names no subtask.
    #[error("subtask '{subtask}' depends on unknown subtask '{dependency}'")]
    DependencyNotFound {
        /// The dependent subtask.
        subtask: String,
        /// The missing key.
        dependency: String,
    },

    /// The dependencies form a cycle.
    #[error("circular dependency involving: {0}")]
    CycleDetected(String),
}

/// Dependency graph of a phase's subtasks.
///
/// Edges run from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct SubtaskGraph {
    graph: DiGraph<Subtask, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl SubtaskGraph {
    /// Builds and validates the graph.
    ///
    /// # Errors
    /// Returns `DagError` for duplicate keys, unknown dependencies or cycles.
    pub fn new(subtasks: Vec<Subtask>) -> Result<Self, DagError> {
        let mut graph = DiGraph::with_capacity(subtasks.len(), subtasks.len());
        let mut node_map = HashMap::with_capacity(subtasks.len());

        for subtask in subtasks {
            let key = subtask.key.clone();
            if node_map.contains_key(&key) {
                return Err(DagError::DuplicateKey(key));
            }
            let node = graph.add_node(subtask);
            node_map.insert(key, node);
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let subtask = &graph[node];
            for dependency in &subtask.depends_on {
                let from = node_map.get(dependency).ok_or_else(|| DagError::DependencyNotFound {
                    subtask: subtask.key.clone(),
                    dependency: dependency.clone(),
                })?;
                edges.push((*from, node));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        if is_cyclic_directed(&graph) {
            let involved = match toposort(&graph, None) {
                Err(cycle) => graph[cycle.node_id()].key.clone(),
                Ok(_) => String::new(),
            };
            return Err(DagError::CycleDetected(involved));
        }

        Ok(Self { graph, node_map })
    }

    /// Number of subtasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All node indices in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// The subtask at a node.
    pub fn subtask(&self, node: NodeIndex) -> &Subtask {
        &self.graph[node]
    }

    /// Looks up a node by key.
    pub fn node(&self, key: &str) -> Option<NodeIndex> {
        self.node_map.get(key).copied()
    }

    /// Number of direct dependencies of a node.
    pub fn dependency_count(&self, node: NodeIndex) -> usize {
        self.graph.neighbors_directed(node, Direction::Incoming).count()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(node, Direction::Incoming).collect()
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(node, Direction::Outgoing).collect()
    }

    /// Every node reachable from `node` along dependency edges.
    pub fn transitive_dependents(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut dfs = petgraph::visit::Dfs::new(&self.graph, node);
        let mut out = Vec::new();
        while let Some(next) = dfs.next(&self.graph) {
            if next != node {
                out.push(next);
            }
        }
        out
    }

    /// Nodes with no dependencies, in insertion order.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().filter(|n| self.dependency_count(*n) == 0).collect()
    }

    /// Topological order of the subtask keys.
    pub fn topological_keys(&self) -> Vec<String> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n].key.clone()).collect())
            .unwrap_or_default()
    }
}
