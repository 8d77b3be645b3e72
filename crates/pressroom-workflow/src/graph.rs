//! Workflow graphs: a node registry plus an edge table.
//!
//! Edges are plain data, so a graph can be checked and inspected without
//! running it. Interrupt points are a flag on the node.

use crate::state::{StateUpdate, WorkflowState};
use async_trait::async_trait;
use pressroom_core::{PressroomError, PressroomResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// One step of a workflow: reads the state, returns the keys to overwrite.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate>;
}

/// Adapts a synchronous closure into a [`Node`].
pub struct FnNode<F>(F);

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(&WorkflowState) -> PressroomResult<StateUpdate> + Send + Sync,
{
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        (self.0)(state)
    }
}

/// Wrap a closure as a shareable node.
pub fn node_fn<F>(f: F) -> Arc<dyn Node>
where
    F: Fn(&WorkflowState) -> PressroomResult<StateUpdate> + Send + Sync + 'static,
{
    Arc::new(FnNode(f))
}

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Target {
    Node(String),
    End,
}

impl Target {
    pub fn node(name: impl Into<String>) -> Self {
        Target::Node(name.into())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Node(name) => f.write_str(name),
            Target::End => f.write_str("END"),
        }
    }
}

/// Outgoing edge of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Edge {
    Direct(Target),
    /// Pick a target by the string form of `state[key]`.
    Branch {
        key: String,
        cases: BTreeMap<String, Target>,
        default: Option<Target>,
    },
}

impl Edge {
    fn targets(&self) -> Vec<&Target> {
        match self {
            Edge::Direct(target) => vec![target],
            Edge::Branch { cases, default, .. } => {
                cases.values().chain(default.iter()).collect()
            }
        }
    }
}

struct NodeEntry {
    node: Arc<dyn Node>,
    interrupt: bool,
}

/// A validated, immutable workflow graph.
pub struct WorkflowGraph {
    name: String,
    entry: String,
    nodes: HashMap<String, NodeEntry>,
    edges: HashMap<String, Edge>,
}

impl WorkflowGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn is_interrupt(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(|n| n.interrupt)
    }

    /// Nodes execution pauses before, sorted by name.
    pub fn interrupt_points(&self) -> Vec<&str> {
        let mut points: Vec<&str> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.interrupt)
            .map(|(name, _)| name.as_str())
            .collect();
        points.sort_unstable();
        points
    }

    pub fn edge(&self, node: &str) -> Option<&Edge> {
        self.edges.get(node)
    }

    /// Every target the node's edge can lead to, deduplicated and sorted.
    pub fn successors(&self, node: &str) -> Vec<Target> {
        let set: BTreeSet<Target> = self
            .edges
            .get(node)
            .map(|e| e.targets().into_iter().cloned().collect())
            .unwrap_or_default();
        set.into_iter().collect()
    }

    /// Nodes reachable from the entry, including the entry itself.
    pub fn reachable(&self) -> BTreeSet<String> {
        reachable_from(&self.entry, &self.edges)
    }

    pub(crate) fn node(&self, name: &str) -> PressroomResult<&Arc<dyn Node>> {
        self.nodes
            .get(name)
            .map(|n| &n.node)
            .ok_or_else(|| {
                PressroomError::Workflow(format!("workflow '{}' has no node '{name}'", self.name))
            })
    }

    /// Follow `node`'s edge for the given state.
    pub fn next(&self, node: &str, state: &WorkflowState) -> PressroomResult<Target> {
        let edge = self.edges.get(node).ok_or_else(|| {
            PressroomError::Workflow(format!("node '{node}' has no outgoing edge"))
        })?;
        match edge {
            Edge::Direct(target) => Ok(target.clone()),
            Edge::Branch {
                key,
                cases,
                default,
            } => {
                let value = state.branch_key(key);
                value
                    .as_deref()
                    .and_then(|v| cases.get(v))
                    .or(default.as_ref())
                    .cloned()
                    .ok_or_else(|| {
                        PressroomError::Workflow(format!(
                            "node '{node}': no branch for {key}={}",
                            value.as_deref().unwrap_or("<unset>")
                        ))
                    })
            }
        }
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("interrupts", &self.interrupt_points())
            .field("edges", &self.edges)
            .finish()
    }
}

fn reachable_from(entry: &str, edges: &HashMap<String, Edge>) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([entry.to_string()]);
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Some(edge) = edges.get(&name) {
            for target in edge.targets() {
                if let Target::Node(next) = target {
                    if !seen.contains(next) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
    }
    seen
}

/// Assembles and validates a [`WorkflowGraph`].
pub struct GraphBuilder {
    name: String,
    entry: Option<String>,
    nodes: HashMap<String, NodeEntry>,
    edges: HashMap<String, Edge>,
    problems: Vec<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            problems: Vec::new(),
        }
    }

    pub fn add_node(self, name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        self.insert_node(name.into(), node, false)
    }

    /// Add a node that execution pauses before, awaiting a human decision.
    pub fn add_interrupt_node(self, name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        self.insert_node(name.into(), node, true)
    }

    fn insert_node(mut self, name: String, node: Arc<dyn Node>, interrupt: bool) -> Self {
        if self.nodes.contains_key(&name) {
            self.problems.push(format!("node '{name}' registered twice"));
        } else {
            self.nodes.insert(name, NodeEntry { node, interrupt });
        }
        self
    }

    pub fn add_edge(self, from: impl Into<String>, to: Target) -> Self {
        self.insert_edge(from.into(), Edge::Direct(to))
    }

    pub fn add_branch<K>(
        self,
        from: impl Into<String>,
        key: impl Into<String>,
        cases: impl IntoIterator<Item = (K, Target)>,
        default: Option<Target>,
    ) -> Self
    where
        K: Into<String>,
    {
        let cases = cases.into_iter().map(|(k, t)| (k.into(), t)).collect();
        self.insert_edge(
            from.into(),
            Edge::Branch {
                key: key.into(),
                cases,
                default,
            },
        )
    }

    fn insert_edge(mut self, from: String, edge: Edge) -> Self {
        if self.edges.contains_key(&from) {
            self.problems
                .push(format!("node '{from}' has more than one outgoing edge"));
        } else {
            self.edges.insert(from, edge);
        }
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn build(self) -> PressroomResult<WorkflowGraph> {
        let invalid = |msg: String| {
            PressroomError::Workflow(format!("workflow '{}': {msg}", self.name))
        };

        if let Some(problem) = self.problems.first() {
            return Err(invalid(problem.clone()));
        }
        let entry = self
            .entry
            .clone()
            .ok_or_else(|| invalid("no entry node set".into()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(invalid(format!("entry node '{entry}' is not registered")));
        }

        let mut from_names: Vec<&String> = self.edges.keys().collect();
        from_names.sort();
        for from in from_names {
            if !self.nodes.contains_key(from) {
                return Err(invalid(format!("edge from unknown node '{from}'")));
            }
            for target in self.edges[from].targets() {
                if let Target::Node(to) = target {
                    if !self.nodes.contains_key(to) {
                        return Err(invalid(format!("edge '{from}' -> '{to}' has no target node")));
                    }
                }
            }
        }

        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        for name in &names {
            if !self.edges.contains_key(*name) {
                return Err(invalid(format!("node '{name}' has no outgoing edge")));
            }
        }

        let reachable = reachable_from(&entry, &self.edges);
        if let Some(orphan) = names.iter().find(|n| !reachable.contains(n.as_str())) {
            return Err(invalid(format!("node '{orphan}' is unreachable from '{entry}'")));
        }

        Ok(WorkflowGraph {
            name: self.name,
            entry,
            nodes: self.nodes,
            edges: self.edges,
        })
    }
}
