//! Building multi-step plans for plan-and-act scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use troupe_core::error::{Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::traits::{Action, LlmClient};
use troupe_core::types::{ActionTag, GenerateOptions, Message};

use crate::graph::{DependencyGraph, NodeId, NodeStatus};

/// A validated, acyclic dependency graph of planned steps.
pub struct Plan {
    graph: DependencyGraph,
}

impl Plan {
    /// Wrap a graph, rejecting it if it has a cycle.
    pub fn new(mut graph: DependencyGraph) -> Result<Self> {
        if let Some(cycle) = graph.find_cycle() {
            let nodes = cycle
                .iter()
                .map(|id| {
                    graph
                        .node(id)
                        .map(|n| n.name().to_string())
                        .unwrap_or_else(|| id.to_string())
                })
                .collect();
            return Err(TroupeError::CycleDetected { nodes });
        }
        graph.topological_sort();
        Ok(Self { graph })
    }

    /// First node in execution order that is pending with its dependencies met.
    pub fn next_eligible(&mut self) -> Option<NodeId> {
        let order = self.graph.execution_order();
        order.into_iter().find(|id| self.graph.is_ready(id))
    }

    /// Every step completed.
    pub fn is_finished(&self) -> bool {
        self.graph.status() == NodeStatus::Completed
    }

    pub fn has_failed(&self) -> bool {
        self.graph.status() == NodeStatus::Failed
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }
}

/// What a planner has to work with.
#[derive(Clone, Default)]
pub struct PlanInput {
    pub role: String,
    pub goal: String,
    /// Registered actions in registration order.
    pub actions: Vec<Arc<dyn Action>>,
    pub news: Vec<Message>,
    pub event_bus: Option<Arc<EventBus>>,
}

impl PlanInput {
    fn new_graph(&self) -> DependencyGraph {
        match self.event_bus {
            Some(ref bus) => DependencyGraph::new().with_event_bus(bus.clone()),
            None => DependencyGraph::new(),
        }
    }

    fn find(&self, tag: &ActionTag) -> Result<Arc<dyn Action>> {
        self.actions
            .iter()
            .find(|a| &a.tag() == tag)
            .cloned()
            .ok_or_else(|| TroupeError::ActionNotFound(tag.to_string()))
    }
}

/// Turns a role's actions and latest input into a plan.
pub trait Planner: Send + Sync + 'static {
    fn plan(&self, input: PlanInput) -> BoxFuture<'_, Result<Plan>>;
}

/// Chains every registered action in registration order.
pub struct SequentialPlanner;

impl Planner for SequentialPlanner {
    fn plan(&self, input: PlanInput) -> BoxFuture<'_, Result<Plan>> {
        Box::pin(async move {
            let mut graph = input.new_graph();
            let mut prev: Option<NodeId> = None;
            for action in &input.actions {
                let id = graph.add_node(action.clone());
                if let Some(ref p) = prev {
                    graph.add_edge(p, &id)?;
                }
                prev = Some(id);
            }
            debug!(role = %input.role, steps = graph.len(), "Sequential plan built");
            Plan::new(graph)
        })
    }
}

/// One planned step: the action tag and the tags that must complete first.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    #[serde(alias = "action")]
    pub tag: String,
    #[serde(default, alias = "depends_on")]
    pub after: Vec<String>,
}

impl PlanStep {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            after: Vec::new(),
        }
    }

    pub fn after(mut self, tag: impl Into<String>) -> Self {
        self.after.push(tag.into());
        self
    }
}

/// Build a graph from explicit steps, resolving each tag against `input`.
fn graph_from_steps(input: &PlanInput, steps: &[PlanStep]) -> Result<DependencyGraph> {
    let mut graph = input.new_graph();
    let mut ids: HashMap<&str, NodeId> = HashMap::new();

    for step in steps {
        if ids.contains_key(step.tag.as_str()) {
            return Err(TroupeError::Planning(format!(
                "step {} planned twice",
                step.tag
            )));
        }
        let action = input.find(&ActionTag::new(step.tag.as_str()))?;
        ids.insert(step.tag.as_str(), graph.add_node(action));
    }

    for step in steps {
        let to = &ids[step.tag.as_str()];
        for dep in &step.after {
            let from = ids.get(dep.as_str()).ok_or_else(|| {
                TroupeError::Planning(format!("step {} depends on unknown step {dep}", step.tag))
            })?;
            graph.add_edge(from, to)?;
        }
    }
    Ok(graph)
}

/// Plans from a fixed list of steps with declared dependencies.
pub struct DeclaredPlanner {
    steps: Vec<PlanStep>,
}

impl DeclaredPlanner {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }
}

impl Planner for DeclaredPlanner {
    fn plan(&self, input: PlanInput) -> BoxFuture<'_, Result<Plan>> {
        Box::pin(async move {
            let graph = graph_from_steps(&input, &self.steps)?;
            Plan::new(graph)
        })
    }
}

/// Asks an LLM for a JSON list of steps, e.g.
/// `[{"action": "write_code"}, {"action": "write_test", "after": ["write_code"]}]`.
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    options: GenerateOptions,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    fn prompt(input: &PlanInput) -> String {
        let mut prompt = format!("You are {}. Goal: {}\n\n", input.role, input.goal);
        if let Some(latest) = input.news.last() {
            prompt.push_str(&format!("Latest request: {}\n\n", latest.content()));
        }
        prompt.push_str("Available steps:\n");
        for action in &input.actions {
            prompt.push_str(&format!("- {}\n", action.tag()));
        }
        prompt.push_str(
            "\nRespond with a JSON array of steps, each an object with an \"action\" \
             field naming one available step and an optional \"after\" array naming \
             steps that must finish first.\n",
        );
        prompt
    }
}

/// Pull the first JSON array out of free text and decode it as steps.
pub fn parse_steps(reply: &str) -> Result<Vec<PlanStep>> {
    let re = Regex::new(r"(?s)\[.*\]").map_err(|e| TroupeError::LlmParse(e.to_string()))?;
    let json = re
        .find(reply)
        .ok_or_else(|| TroupeError::LlmParse("no JSON array in plan reply".into()))?;
    serde_json::from_str(json.as_str()).map_err(|e| TroupeError::LlmParse(e.to_string()))
}

impl Planner for LlmPlanner {
    fn plan(&self, input: PlanInput) -> BoxFuture<'_, Result<Plan>> {
        Box::pin(async move {
            let reply = self.llm.generate(&Self::prompt(&input), &self.options).await?;
            let steps = parse_steps(&reply)?;
            if steps.is_empty() {
                return Err(TroupeError::Planning("planner returned no steps".into()));
            }
            info!(role = %input.role, steps = steps.len(), "LLM plan received");
            Plan::new(graph_from_steps(&input, &steps)?)
        })
    }
}
