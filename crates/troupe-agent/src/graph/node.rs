use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use troupe_core::traits::Action;
use troupe_core::types::{ActionOutput, ActionTag};

/// Graph-assigned node identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status of a node, and (aggregated) of a whole graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        }
    }

    /// Severity used when aggregating: failed > running > pending > completed.
    pub fn severity(&self) -> u8 {
        match self {
            NodeStatus::Completed => 0,
            NodeStatus::Pending => 1,
            NodeStatus::Running => 2,
            NodeStatus::Failed => 3,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduler-owned wrapper around one unit of work.
///
/// Edges are stored on both ends: `successors` must run after this node,
/// `predecessors` must complete before it.
pub struct GraphNode {
    id: NodeId,
    action: Arc<dyn Action>,
    pub(crate) status: NodeStatus,
    pub(crate) result: Option<ActionOutput>,
    pub(crate) successors: Vec<NodeId>,
    pub(crate) predecessors: Vec<NodeId>,
}

impl GraphNode {
    pub(crate) fn new(action: Arc<dyn Action>) -> Self {
        Self {
            id: NodeId::new(),
            action,
            status: NodeStatus::Pending,
            result: None,
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }

    pub fn tag(&self) -> ActionTag {
        self.action.tag()
    }

    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn result(&self) -> Option<&ActionOutput> {
        self.result.as_ref()
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    /// Back to pending with the result cleared.
    pub(crate) fn reset(&mut self) {
        self.status = NodeStatus::Pending;
        self.result = None;
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status)
            .field("successors", &self.successors.len())
            .field("predecessors", &self.predecessors.len())
            .finish()
    }
}
