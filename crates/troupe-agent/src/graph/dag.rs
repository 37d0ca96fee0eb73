use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use troupe_core::error::{Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::traits::Action;
use troupe_core::types::{ActionContext, ActionOutput, ActionStatus, AgentEvent};

use super::node::{GraphNode, NodeId, NodeStatus};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Count of nodes per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphSummary {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Dependency graph of units of work.
///
/// An edge `from -> to` means `from` must complete before `to` may run.
/// Execution walks the topological order strictly in sequence, gating each
/// node on its predecessors and aborting at the first failure.
pub struct DependencyGraph {
    nodes: HashMap<NodeId, GraphNode>,
    /// Registration order; keeps traversal deterministic.
    insertion: Vec<NodeId>,
    /// Adjacency list: node -> nodes that depend on it.
    edges: HashMap<NodeId, Vec<NodeId>>,
    execution_order: Vec<NodeId>,
    modified: bool,
    event_bus: Option<Arc<EventBus>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            insertion: Vec::new(),
            edges: HashMap::new(),
            execution_order: Vec::new(),
            modified: false,
            event_bus: None,
        }
    }

    /// Publish node status changes on an event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Wrap a unit of work in a new node and return its id.
    pub fn add_node(&mut self, action: Arc<dyn Action>) -> NodeId {
        let node = GraphNode::new(action);
        let id = node.id().clone();
        debug!(node_id = %id, name = node.name(), "Graph node added");
        self.edges.insert(id.clone(), Vec::new());
        self.insertion.push(id.clone());
        self.nodes.insert(id.clone(), node);
        self.modified = true;
        id
    }

    /// Record that `from` must complete before `to`. Both nodes must exist;
    /// adding an existing edge again is a no-op.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId) -> Result<()> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(TroupeError::NodeNotFound(id.to_string()));
            }
        }

        let successors = self.edges.entry(from.clone()).or_default();
        if successors.contains(to) {
            return Ok(());
        }
        successors.push(to.clone());

        if let Some(node) = self.nodes.get_mut(from) {
            node.successors.push(to.clone());
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.predecessors.push(from.clone());
        }
        self.modified = true;
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.insertion.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Edges as `(from, to)` pairs in registration order.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.insertion
            .iter()
            .flat_map(|from| {
                self.edges
                    .get(from)
                    .into_iter()
                    .flatten()
                    .map(move |to| (from.clone(), to.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first post-order: a node is placed ahead of everything reachable
    /// through its outgoing edges. Recomputed only after the graph changed.
    pub fn topological_sort(&mut self) -> &[NodeId] {
        if self.modified {
            let mut visited = HashSet::new();
            let mut order = Vec::with_capacity(self.nodes.len());
            for id in &self.insertion {
                self.visit(id, &mut visited, &mut order);
            }
            order.reverse();
            self.execution_order = order;
            self.modified = false;
            debug!(nodes = self.execution_order.len(), "Execution order recomputed");
        }
        &self.execution_order
    }

    /// Post-order walk from `root` with an explicit stack of
    /// `(node, next successor index)` frames, so chain depth is not bounded
    /// by the thread stack.
    fn visit<'a>(&'a self, root: &'a NodeId, visited: &mut HashSet<NodeId>, order: &mut Vec<NodeId>) {
        if !visited.insert(root.clone()) {
            return;
        }
        let mut stack: Vec<(&'a NodeId, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let id = frame.0;
            match self.successors_of(id).get(frame.1) {
                Some(next) => {
                    frame.1 += 1;
                    if visited.insert(next.clone()) {
                        stack.push((next, 0));
                    }
                }
                None => {
                    order.push(id.clone());
                    stack.pop();
                }
            }
        }
    }

    fn successors_of(&self, id: &NodeId) -> &[NodeId] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The memoized topological order.
    pub fn execution_order(&mut self) -> Vec<NodeId> {
        self.topological_sort().to_vec()
    }

    pub fn has_cycles(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// One cycle as a closed path (`a, b, ..., a`), if any exists.
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut color: HashMap<&NodeId, Color> =
            self.insertion.iter().map(|id| (id, Color::White)).collect();

        for id in &self.insertion {
            if color.get(id) == Some(&Color::White) {
                if let Some(cycle) = self.dfs_cycle(id, &mut color) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// White/gray/black walk from `root`. The frame stack doubles as the
    /// current gray path, which is sliced to report the cycle.
    fn dfs_cycle<'a>(
        &'a self,
        root: &'a NodeId,
        color: &mut HashMap<&'a NodeId, Color>,
    ) -> Option<Vec<NodeId>> {
        color.insert(root, Color::Gray);
        let mut stack: Vec<(&'a NodeId, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let id = frame.0;
            let Some(next) = self.successors_of(id).get(frame.1) else {
                color.insert(id, Color::Black);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            match color.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut cycle: Vec<NodeId> =
                        stack[start..].iter().map(|(n, _)| (*n).clone()).collect();
                    cycle.push(next.clone());
                    return Some(cycle);
                }
                Color::White => {
                    color.insert(next, Color::Gray);
                    stack.push((next, 0));
                }
                Color::Black => {}
            }
        }
        None
    }

    /// Whether every predecessor of `id` has completed.
    pub fn dependencies_met(&self, id: &NodeId) -> bool {
        self.nodes.get(id).is_some_and(|node| {
            node.predecessors.iter().all(|p| {
                self.nodes
                    .get(p)
                    .is_some_and(|pred| pred.status == NodeStatus::Completed)
            })
        })
    }

    /// Pending with all dependencies met.
    pub fn is_ready(&self, id: &NodeId) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|n| n.status == NodeStatus::Pending)
            && self.dependencies_met(id)
    }

    /// Execute the whole graph (or the tail of the order starting at `start`).
    pub async fn execute(&mut self, start: Option<&NodeId>) -> Result<ActionOutput> {
        self.execute_with(start, ActionContext::default()).await
    }

    /// Execute with a base context handed to every node. Each node also gets
    /// its completed predecessors' outputs in `upstream`.
    ///
    /// Returns the last completed output (empty when nothing ran), or the
    /// failed node's output if execution aborted. Cycles and an unknown
    /// `start` are errors raised before any node runs.
    pub async fn execute_with(
        &mut self,
        start: Option<&NodeId>,
        base: ActionContext,
    ) -> Result<ActionOutput> {
        self.topological_sort();

        if let Some(cycle) = self.find_cycle() {
            let nodes: Vec<String> = cycle.iter().map(|id| self.display_name(id)).collect();
            error!(cycle = %nodes.join(" -> "), "Refusing to execute cyclic graph");
            return Err(TroupeError::CycleDetected { nodes });
        }

        let order = match start {
            Some(start_id) => {
                let pos = self
                    .execution_order
                    .iter()
                    .position(|id| id == start_id)
                    .ok_or_else(|| TroupeError::NodeNotFound(start_id.to_string()))?;
                self.execution_order[pos..].to_vec()
            }
            None => self.execution_order.clone(),
        };

        info!(nodes = order.len(), "Executing dependency graph");
        let mut last: Option<ActionOutput> = None;

        for id in &order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if node.status != NodeStatus::Pending {
                debug!(node_id = %id, status = %node.status, "Node already ran this pass, skipping");
                continue;
            }
            if !self.dependencies_met(id) {
                debug!(node_id = %id, name = node.name(), "Dependencies not met, deferring node");
                continue;
            }

            let output = self.run_node(id, base.clone()).await?;
            match output.status {
                ActionStatus::Completed => last = Some(output),
                ActionStatus::Failed => {
                    warn!(
                        node_id = %id,
                        name = %self.display_name(id),
                        "Node failed, aborting graph execution"
                    );
                    return Ok(output);
                }
                ActionStatus::Blocked => {}
            }
        }

        info!(status = %self.status(), "Graph execution finished");
        Ok(last.unwrap_or_else(ActionOutput::empty))
    }

    /// Run a single node if it is ready. A node that is not ready is left
    /// untouched and a `Blocked` output is returned.
    pub async fn execute_node(&mut self, id: &NodeId, base: ActionContext) -> Result<ActionOutput> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TroupeError::NodeNotFound(id.to_string()))?;
        if !self.is_ready(id) {
            return Ok(ActionOutput::blocked(format!(
                "{} is not ready (status {})",
                node.name(),
                node.status
            )));
        }
        self.run_node(id, base).await
    }

    async fn run_node(&mut self, id: &NodeId, mut ctx: ActionContext) -> Result<ActionOutput> {
        let (action, upstream) = {
            let node = self
                .nodes
                .get(id)
                .ok_or_else(|| TroupeError::NodeNotFound(id.to_string()))?;
            let upstream: Vec<ActionOutput> = node
                .predecessors
                .iter()
                .filter_map(|p| self.nodes.get(p).and_then(|n| n.result.clone()))
                .collect();
            (node.action().clone(), upstream)
        };
        ctx.upstream = upstream;

        self.set_status(id, NodeStatus::Running);
        debug!(node_id = %id, name = action.name(), "Running graph node");

        let output = match action.run(ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(node_id = %id, name = action.name(), error = %e, "Graph node raised an error");
                let mut output = action
                    .handle_exception(&e)
                    .unwrap_or_else(|| ActionOutput::failed(e.to_string()));
                output.status = ActionStatus::Failed;
                output
            }
        };

        match output.status {
            ActionStatus::Completed => {
                self.store_result(id, output.clone());
                self.set_status(id, NodeStatus::Completed);
            }
            ActionStatus::Failed => {
                self.store_result(id, output.clone());
                self.set_status(id, NodeStatus::Failed);
            }
            ActionStatus::Blocked => {
                debug!(node_id = %id, "Node reported blocked, returning to pending");
                if let Some(node) = self.nodes.get_mut(id) {
                    node.reset();
                }
                self.publish_status(id);
            }
        }
        Ok(output)
    }

    fn store_result(&mut self, id: &NodeId, output: ActionOutput) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.result = Some(output);
        }
    }

    fn set_status(&mut self, id: &NodeId, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = status;
        }
        self.publish_status(id);
    }

    fn publish_status(&self, id: &NodeId) {
        if let (Some(bus), Some(node)) = (&self.event_bus, self.nodes.get(id)) {
            bus.publish(AgentEvent::NodeStatusChanged {
                node_id: id.to_string(),
                name: node.name().to_string(),
                status: node.status.to_string(),
            });
        }
    }

    /// Return every node to pending with its result cleared.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset();
        }
        for id in &self.insertion {
            self.publish_status(id);
        }
        debug!(nodes = self.nodes.len(), "Graph reset");
    }

    /// Aggregate status, by severity: failed > running > pending > completed.
    /// An empty graph is completed.
    pub fn status(&self) -> NodeStatus {
        self.nodes
            .values()
            .map(|n| n.status)
            .max_by_key(NodeStatus::severity)
            .unwrap_or(NodeStatus::Completed)
    }

    pub fn summary(&self) -> GraphSummary {
        let mut summary = GraphSummary::default();
        for node in self.nodes.values() {
            match node.status {
                NodeStatus::Pending => summary.pending += 1,
                NodeStatus::Running => summary.running += 1,
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Recorded outputs in registration order.
    pub fn results(&self) -> Vec<(NodeId, ActionOutput)> {
        self.nodes()
            .filter_map(|n| n.result.clone().map(|r| (n.id().clone(), r)))
            .collect()
    }

    /// Graphviz rendering. Nodes are labeled by name (suffixed with their
    /// position when names repeat) and filled by status.
    pub fn to_dot(&self) -> String {
        let ids = self.dot_ids();
        let mut out = String::from("digraph G {\n    rankdir=LR;\n");

        for id in &self.insertion {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let fill = match node.status {
                NodeStatus::Pending => "white",
                NodeStatus::Running => "lightblue",
                NodeStatus::Completed => "palegreen",
                NodeStatus::Failed => "salmon",
            };
            out.push_str(&format!(
                "    {} [label={}, style=filled, fillcolor={}];\n",
                ids[id],
                quote(node.name()),
                fill
            ));
        }

        for (from, to) in self.edges() {
            out.push_str(&format!("    {}->{};\n", ids[&from], ids[&to]));
        }

        out.push_str("}\n");
        out
    }

    fn dot_ids(&self) -> HashMap<NodeId, String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.name()).or_insert(0) += 1;
        }

        self.insertion
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                let node = self.nodes.get(id)?;
                let raw = if counts.get(node.name()).copied().unwrap_or(0) > 1 {
                    format!("{}_{}", node.name(), i)
                } else {
                    node.name().to_string()
                };
                Some((id.clone(), dot_identifier(&raw)))
            })
            .collect()
    }

    fn display_name(&self, id: &NodeId) -> String {
        self.nodes
            .get(id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn dot_identifier(raw: &str) -> String {
    let plain = raw
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        raw.to_string()
    } else {
        quote(raw)
    }
}

fn quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}
