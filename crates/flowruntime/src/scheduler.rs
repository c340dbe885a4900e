//! Dependency scheduler.
//!
//! Turns nodes and their dependencies into an execution plan: a total order
//! for sequential runs, or dependency-level groups for parallel runs. Pure
//! computation, no I/O and no state beyond the graph itself.

use flowcore::{ExecutionMode, NodeId, Workflow, WorkflowError};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Default estimate for a worker entry without one, in ms
pub const DEFAULT_ESTIMATE_MS: u64 = 30_000;
/// Default estimate for an inserted manager entry, in ms
pub const MANAGER_ESTIMATE_MS: u64 = 60_000;

/// Scheduler input: a node and the ids it depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    #[serde(alias = "nodeId")]
    pub id: NodeId,
    #[serde(default = "default_node_type", alias = "type")]
    pub node_type: String,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub estimated_ms: Option<u64>,
}

fn default_node_type() -> String {
    "worker".to_string()
}

impl PlanNode {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            dependencies: Vec::new(),
            priority: 0,
            estimated_ms: None,
        }
    }

    pub fn with_dependencies<I>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<NodeId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, estimated_ms: u64) -> Self {
        self.estimated_ms = Some(estimated_ms);
        self
    }
}

/// One step of an execution plan. Read-only to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub node_id: NodeId,
    pub node_type: String,
    pub order: usize,
    pub dependencies: Vec<NodeId>,
    pub is_manager: bool,
    pub estimated_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    /// Sequential plans hold one entry per group
    pub groups: Vec<Vec<PlanEntry>>,
}

impl ExecutionPlan {
    /// All entries in plan order
    pub fn entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.groups.iter().flatten()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.entries().map(|e| e.node_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_estimated_ms(&self) -> u64 {
        self.entries().map(|e| e.estimated_ms).sum()
    }
}

/// Validated dependency graph. Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<PlanNode>,
    /// Dependency positions per node, deduplicated, in declaration order
    deps: Vec<Vec<usize>>,
    index: HashMap<NodeId, NodeIndex>,
    graph: DiGraph<usize, ()>,
}

impl DependencyGraph {
    /// Rejects duplicate ids and dependencies on unknown nodes. Cycles are
    /// accepted here and reported when a plan is requested.
    pub fn new(nodes: Vec<PlanNode>) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(nodes.len());
        for (pos, node) in nodes.iter().enumerate() {
            if index.contains_key(&node.id) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
            index.insert(node.id.clone(), graph.add_node(pos));
        }

        let mut deps = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let target = index[&node.id];
            let mut seen = HashSet::new();
            let mut positions = Vec::new();
            for dep in &node.dependencies {
                let source = *index.get(dep).ok_or_else(|| WorkflowError::DanglingDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                })?;
                if seen.insert(source) {
                    graph.add_edge(source, target, ());
                    positions.push(graph[source]);
                }
            }
            deps.push(positions);
        }

        Ok(Self {
            nodes,
            deps,
            index,
            graph,
        })
    }

    pub fn from_workflow(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let nodes = workflow
            .nodes
            .iter()
            .map(|spec| PlanNode {
                id: spec.id.clone(),
                node_type: spec.node_type.clone(),
                dependencies: workflow.dependencies_of(&spec.id),
                priority: spec.priority,
                estimated_ms: spec.estimated_ms,
            })
            .collect();
        Self::new(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.index.get(id).map(|&idx| &self.nodes[self.graph[idx]])
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// Direct dependencies of `id`, in declaration order
    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        match self.index.get(id) {
            Some(&idx) => self.deps[self.graph[idx]]
                .iter()
                .map(|&pos| self.nodes[pos].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Direct dependents of `id`, in declaration order
    pub fn dependents(&self, id: &str) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions.into_iter().map(|pos| self.nodes[pos].id.clone()).collect()
    }

    /// Every node reachable downstream of `id`
    pub fn downstream(&self, id: &str) -> HashSet<NodeId> {
        let mut found = HashSet::new();
        let mut stack = self.dependents(id);
        while let Some(next) = stack.pop() {
            if found.insert(next.clone()) {
                stack.extend(self.dependents(&next));
            }
        }
        found
    }

    /// Post-order depth-first walk from every node in declaration order,
    /// dependencies first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, WorkflowError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        // (node, index of the next dependency to visit)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::New {
                continue;
            }
            marks[root] = Mark::Active;
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                match self.deps[node].get(next) {
                    Some(&dep) => {
                        frame.1 += 1;
                        match marks[dep] {
                            Mark::New => {
                                marks[dep] = Mark::Active;
                                stack.push((dep, 0));
                            }
                            Mark::Active => {
                                let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                                let nodes = stack[start..]
                                    .iter()
                                    .map(|&(n, _)| self.nodes[n].id.clone())
                                    .collect();
                                return Err(WorkflowError::CycleDetected { nodes });
                            }
                            Mark::Done => {}
                        }
                    }
                    None => {
                        marks[node] = Mark::Done;
                        order.push(self.nodes[node].id.clone());
                        stack.pop();
                    }
                }
            }
        }

        Ok(order)
    }

    /// Dependency levels. Each node's dependencies lie in strictly earlier groups.
    /// Within a group: priority descending, then declaration order.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<NodeId>>, WorkflowError> {
        let mut scheduled = vec![false; self.nodes.len()];
        let mut remaining = self.nodes.len();
        let mut groups = Vec::new();

        while remaining > 0 {
            let mut frontier: Vec<usize> = (0..self.nodes.len())
                .filter(|&pos| !scheduled[pos] && self.deps[pos].iter().all(|&d| scheduled[d]))
                .collect();

            if frontier.is_empty() {
                return Err(WorkflowError::CycleDetected {
                    nodes: self.cyclic_nodes(&scheduled),
                });
            }

            frontier.sort_by(|&a, &b| {
                self.nodes[b]
                    .priority
                    .cmp(&self.nodes[a].priority)
                    .then(a.cmp(&b))
            });
            for &pos in &frontier {
                scheduled[pos] = true;
            }
            remaining -= frontier.len();
            groups.push(frontier.into_iter().map(|pos| self.nodes[pos].id.clone()).collect());
        }

        Ok(groups)
    }

    /// Unscheduled nodes that sit on a cycle, in declaration order
    fn cyclic_nodes(&self, scheduled: &[bool]) -> Vec<NodeId> {
        let mut positions: Vec<usize> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|idx| self.graph[idx])
            .filter(|&pos| !scheduled[pos])
            .collect();
        if positions.is_empty() {
            positions = (0..self.nodes.len()).filter(|&pos| !scheduled[pos]).collect();
        }
        positions.sort_unstable();
        positions.into_iter().map(|pos| self.nodes[pos].id.clone()).collect()
    }

    /// Build the plan for `mode`. Sequential plans follow the total order;
    /// parallel and mixed plans follow the dependency levels.
    pub fn plan(&self, mode: ExecutionMode) -> Result<ExecutionPlan, WorkflowError> {
        let groups = match mode {
            ExecutionMode::Sequential => self
                .topological_order()?
                .into_iter()
                .map(|id| vec![id])
                .collect(),
            ExecutionMode::Parallel | ExecutionMode::Mixed => self.parallel_groups()?,
        };

        let mut order = 0;
        let groups = groups
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .map(|id| {
                        let entry = self.entry(&id, order);
                        order += 1;
                        entry
                    })
                    .collect()
            })
            .collect();

        Ok(ExecutionPlan { mode, groups })
    }

    fn entry(&self, id: &str, order: usize) -> PlanEntry {
        let node = self.node(id);
        PlanEntry {
            node_id: id.to_string(),
            node_type: node.map(|n| n.node_type.clone()).unwrap_or_default(),
            order,
            dependencies: self.dependencies(id),
            is_manager: false,
            estimated_ms: node.and_then(|n| n.estimated_ms).unwrap_or(DEFAULT_ESTIMATE_MS),
        }
    }
}

/// Periodic meta node placed into a plan by [`insert_manager_nodes`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerNode {
    pub node_id: NodeId,
    pub node_type: String,
}

impl ManagerNode {
    pub fn new(node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
        }
    }

    /// Type guessed from the id: supervisor, planner, watcher, scheduler, else manager
    pub fn infer(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        let lower = node_id.to_lowercase();
        let node_type = ["supervisor", "planner", "watcher", "scheduler"]
            .into_iter()
            .find(|kind| lower.contains(kind))
            .unwrap_or("manager");
        Self::new(node_id, node_type)
    }
}

/// Insert every manager after each `interval` regular entries and renumber.
/// Manager entries have no dependencies. An `interval` of zero inserts nothing.
pub fn insert_manager_nodes(
    entries: Vec<PlanEntry>,
    managers: &[ManagerNode],
    interval: usize,
) -> Vec<PlanEntry> {
    if managers.is_empty() || interval == 0 {
        return renumber(entries);
    }

    let mut out = Vec::with_capacity(entries.len() + entries.len() / interval * managers.len());
    let mut regular = 0;
    for entry in entries {
        let is_manager = entry.is_manager;
        out.push(entry);
        if is_manager {
            continue;
        }
        regular += 1;
        if regular % interval == 0 {
            out.extend(managers.iter().map(|m| PlanEntry {
                node_id: m.node_id.clone(),
                node_type: m.node_type.clone(),
                order: 0,
                dependencies: Vec::new(),
                is_manager: true,
                estimated_ms: MANAGER_ESTIMATE_MS,
            }));
        }
    }
    renumber(out)
}

fn renumber(mut entries: Vec<PlanEntry>) -> Vec<PlanEntry> {
    for (order, entry) in entries.iter_mut().enumerate() {
        entry.order = order;
    }
    entries
}
