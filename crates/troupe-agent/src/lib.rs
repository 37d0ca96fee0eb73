pub mod actions;
pub mod graph;
pub mod lifecycle;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod role;
pub mod selector;

pub use actions::{FnAction, LlmAction, StaticAction};
pub use graph::{DependencyGraph, GraphNode, GraphSummary, NodeId, NodeStatus};
pub use lifecycle::{LifecycleEvent, LifecycleMachine, LifecycleSnapshot, LifecycleState};
pub use planner::{DeclaredPlanner, LlmPlanner, Plan, PlanStep, Planner, SequentialPlanner};
pub use policy::SchedulingPolicy;
pub use registry::{ActionRegistry, RegisteredAction};
pub use retry::{BoundedRetry, RetryOutcome};
pub use role::{Role, RoleContext, RoleStatus, Todo};
pub use selector::{LlmSelector, Selector, TriggerSelector};
