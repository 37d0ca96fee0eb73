//! Roles: agents that loop observe -> think -> act -> react over a shared
//! message store.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use troupe_core::config::{AgentConfig, AppConfig, ReactMode};
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::traits::{Action, MessageStore};
use troupe_core::types::{
    ActionContext, ActionOutput, ActionStatus, ActionTag, AgentEvent, Message, MessageId,
};

use crate::graph::{GraphSummary, NodeId};
use crate::lifecycle::{LifecycleEvent, LifecycleMachine, LifecycleSnapshot, LifecycleState};
use crate::planner::{Plan, PlanInput, Planner, SequentialPlanner};
use crate::policy::SchedulingPolicy;
use crate::registry::{ActionRegistry, RegisteredAction};
use crate::retry::BoundedRetry;
use crate::selector::{SelectionInput, Selector, TriggerSelector};

/// The unit of work selected for the next `act`.
#[derive(Debug, Clone, PartialEq)]
pub struct Todo {
    pub tag: ActionTag,
    /// Set when the work is a step of the active plan.
    pub node: Option<NodeId>,
}

/// State owned by a single role and mutated only by its own hooks.
pub struct RoleContext {
    /// Index of the selected action; `None` is the idle sentinel.
    pub state: Option<usize>,
    pub todo: Option<Todo>,
    /// Completed lifecycle passes.
    pub loop_count: usize,
    pub policy: SchedulingPolicy,
    /// Causes this role reacts to when a message is broadcast.
    pub watch: BTreeSet<ActionTag>,
    pub watch_all: bool,
    /// Relevant messages found by the latest `observe`.
    pub news: Vec<Message>,
    /// Everything this role has observed or produced, oldest first.
    pub history: Vec<Message>,
    cursor: usize,
    seen: HashSet<MessageId>,
    order_index: usize,
    plan: Option<Plan>,
}

impl Default for RoleContext {
    fn default() -> Self {
        Self {
            state: None,
            todo: None,
            loop_count: 0,
            policy: SchedulingPolicy::default(),
            watch: BTreeSet::from([ActionTag::user_input()]),
            watch_all: false,
            news: Vec::new(),
            history: Vec::new(),
            cursor: 0,
            seen: HashSet::new(),
            order_index: 0,
            plan: None,
        }
    }
}

/// Point-in-time view of a role.
#[derive(Debug, Clone)]
pub struct RoleStatus {
    pub name: String,
    pub state: LifecycleState,
    pub todo: Option<String>,
    pub loop_count: usize,
    pub react_mode: ReactMode,
    pub history_len: usize,
    pub plan: Option<GraphSummary>,
}

/// An agent. Owns its lifecycle machine, actions, and context; shares only
/// the message store with other roles.
pub struct Role {
    name: String,
    profile: String,
    goal: String,
    constraints: String,
    registry: ActionRegistry,
    store: Arc<dyn MessageStore>,
    selector: Box<dyn Selector>,
    planner: Box<dyn Planner>,
    machine: LifecycleMachine,
    ctx: RoleContext,
    default_max_retry: usize,
    event_bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl Role {
    pub fn new(name: impl Into<String>, store: Arc<dyn MessageStore>) -> Self {
        let name = name.into();
        Self {
            machine: LifecycleMachine::new(name.clone()),
            name,
            profile: String::new(),
            goal: String::new(),
            constraints: String::new(),
            registry: ActionRegistry::new(),
            store,
            selector: Box::new(TriggerSelector),
            planner: Box::new(SequentialPlanner),
            ctx: RoleContext::default(),
            default_max_retry: AgentConfig::default().max_retry,
            event_bus: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a role with the store, event bus, and policy the config selects.
    pub fn from_config(name: impl Into<String>, config: &AppConfig) -> Result<Self> {
        let store = troupe_memory::open_store(&config.memory)?;
        let bus = Arc::new(EventBus::new(config.events.capacity));
        Ok(Self::new(name, store)
            .with_event_bus(bus)
            .with_config(&config.agent))
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = constraints.into();
        self
    }

    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.ctx.policy = SchedulingPolicy::from_config(config);
        self.ctx.watch_all = config.watch_all;
        self.default_max_retry = config.max_retry.max(1);
        self.publish_context();
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.machine.set_event_bus(Some(event_bus.clone()));
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_selector(mut self, selector: impl Selector) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn with_planner(mut self, planner: impl Planner) -> Self {
        self.planner = Box::new(planner);
        self
    }

    /// React to broadcast messages caused by `tag`.
    pub fn watch(mut self, tag: impl Into<ActionTag>) -> Self {
        self.ctx.watch.insert(tag.into());
        self
    }

    /// Replace the watched causes, dropping the default user input.
    pub fn watching<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ActionTag>,
    {
        self.ctx.watch = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn register(&mut self, entry: RegisteredAction) -> Result<()> {
        debug!(role = %self.name, action = %entry.tag, "Action registered");
        self.registry.register(entry)
    }

    pub fn with_registered(mut self, entry: RegisteredAction) -> Result<Self> {
        self.register(entry)?;
        Ok(self)
    }

    pub fn with_action(self, action: impl Action) -> Result<Self> {
        self.with_registered(RegisteredAction::new(Arc::new(action)))
    }

    /// Register an action that the trigger selector picks for messages
    /// caused by `trigger`. The trigger is also watched.
    pub fn with_action_triggered_by(
        self,
        action: impl Action,
        trigger: impl Into<ActionTag>,
    ) -> Result<Self> {
        let trigger = trigger.into();
        self.watch(trigger.clone())
            .with_registered(RegisteredAction::new(Arc::new(action)).triggered_by(trigger))
    }

    /// Register an action that runs through a bounded retry loop with the
    /// configured `max_retry`.
    pub fn with_retrying_action(self, action: impl Action) -> Result<Self> {
        let max_retry = self.default_max_retry;
        self.with_registered(RegisteredAction::new(Arc::new(action)).with_max_retry(max_retry))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn constraints(&self) -> &str {
        &self.constraints
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn context(&self) -> &RoleContext {
        &self.ctx
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.ctx.policy
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    /// Accepted lifecycle transitions, oldest first.
    pub fn transitions(&self) -> &[crate::lifecycle::Transition] {
        self.machine.history()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.machine.subscribe()
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.ctx.plan.as_ref()
    }

    /// Switch scheduling policy. The selected work and history are kept.
    pub fn set_react_mode(&mut self, mode: ReactMode, max_loop: usize) {
        info!(role = %self.name, mode = %mode, max_loop, "React mode changed");
        self.ctx.policy = SchedulingPolicy::new(mode, max_loop);
        self.publish_context();
    }

    // ── Hooks ───────────────────────────────────────────────────

    /// Pull unread messages from the store and keep the relevant ones as news.
    /// Returns whether anything relevant arrived.
    pub async fn observe(&mut self) -> Result<bool> {
        let fresh = self.store.since(self.ctx.cursor).await?;
        self.ctx.cursor += fresh.len();

        let mut news = Vec::new();
        for msg in fresh {
            if self.is_relevant(&msg) && self.ctx.seen.insert(msg.id().clone()) {
                news.push(msg);
            }
        }

        if !news.is_empty() {
            debug!(role = %self.name, count = news.len(), "Observed news");
        }
        self.ctx.history.extend(news.iter().cloned());
        self.ctx.news = news;
        Ok(!self.ctx.news.is_empty())
    }

    fn is_relevant(&self, msg: &Message) -> bool {
        if msg.sent_from() == self.name {
            return false;
        }
        if msg.send_to().contains(&self.name) {
            return true;
        }
        msg.is_broadcast() && (self.ctx.watch_all || self.ctx.watch.contains(msg.cause_by()))
    }

    /// Select the next unit of work into `todo`. Returns whether one was
    /// selected.
    pub async fn think(&mut self) -> Result<bool> {
        let selected = match self.ctx.policy.mode {
            ReactMode::React => self.think_react().await?,
            ReactMode::ByOrder => self.think_by_order(),
            ReactMode::PlanAndAct => self.think_plan().await?,
        };
        if let Some(ref todo) = self.ctx.todo {
            debug!(role = %self.name, todo = %todo.tag, "Selected next action");
        }
        Ok(selected)
    }

    async fn think_react(&mut self) -> Result<bool> {
        if self.registry.len() <= 1 {
            let pick = if self.registry.is_empty() { None } else { Some(0) };
            self.set_state(pick);
            return Ok(pick.is_some());
        }

        let input = self.selection_input();
        let pick = self.selector.select(input).await?;
        self.set_state(pick);
        Ok(pick.is_some())
    }

    fn think_by_order(&mut self) -> bool {
        let next = self.ctx.order_index;
        if next >= self.registry.len() {
            self.ctx.order_index = 0;
            self.set_state(None);
            return false;
        }
        self.ctx.order_index += 1;
        self.set_state(Some(next));
        true
    }

    async fn think_plan(&mut self) -> Result<bool> {
        if self.ctx.plan.is_none() && !self.ctx.news.is_empty() {
            let plan = self.planner.plan(self.plan_input()).await?;
            info!(role = %self.name, steps = plan.len(), "Plan created");
            self.ctx.plan = Some(plan);
        }

        let next = match self.ctx.plan.as_mut() {
            Some(plan) => plan.next_eligible().and_then(|id| {
                plan.graph().node(&id).map(|node| Todo {
                    tag: node.tag(),
                    node: Some(id.clone()),
                })
            }),
            None => None,
        };

        match next {
            Some(todo) => {
                self.ctx.state = self.registry.position(&todo.tag);
                self.ctx.todo = Some(todo);
                self.publish_context();
                Ok(true)
            }
            None => {
                self.set_state(None);
                Ok(false)
            }
        }
    }

    /// Run `todo` and append its outcome to the store as a new message.
    /// Failures of the unit of work are wrapped in the message, not returned.
    pub async fn act(&mut self) -> Result<Message> {
        let todo = self
            .ctx
            .todo
            .clone()
            .ok_or_else(|| TroupeError::ActionNotFound("no action selected".into()))?;
        let ctx = self.action_context();
        info!(role = %self.name, action = %todo.tag, "Acting");
        self.publish(AgentEvent::ActionStarted {
            role: self.name.clone(),
            action: todo.tag.to_string(),
        });

        let (message, status) = match todo.node {
            Some(ref node) => self.act_plan_step(&todo.tag, node, ctx).await?,
            None => {
                let entry = self.registry.require(&todo.tag)?.clone();
                match entry.max_retry {
                    Some(max_retry) => {
                        let mut retry = BoundedRetry::new(max_retry);
                        if let Some(ref bus) = self.event_bus {
                            retry = retry.with_event_bus(bus.clone());
                        }
                        let outcome = retry
                            .run(entry.action.as_ref(), ctx, self.store.as_ref(), &self.name)
                            .await?;
                        let status = if outcome.succeeded {
                            ActionStatus::Completed
                        } else {
                            ActionStatus::Failed
                        };
                        (outcome.message, status)
                    }
                    None => {
                        let output = run_once(entry.action.as_ref(), ctx).await;
                        (self.output_message(&todo.tag, &output), output.status)
                    }
                }
            }
        };

        if status == ActionStatus::Failed {
            warn!(role = %self.name, action = %todo.tag, "Action failed");
        }
        self.store.add(message.clone()).await?;
        self.ctx.seen.insert(message.id().clone());
        self.ctx.history.push(message.clone());
        self.publish(AgentEvent::ActionFinished {
            role: self.name.clone(),
            action: todo.tag.to_string(),
            status,
        });
        Ok(message)
    }

    async fn act_plan_step(
        &mut self,
        tag: &ActionTag,
        node: &NodeId,
        ctx: ActionContext,
    ) -> Result<(Message, ActionStatus)> {
        let plan = self
            .ctx
            .plan
            .as_mut()
            .ok_or_else(|| TroupeError::Planning("no active plan".into()))?;
        let output = plan.graph_mut().execute_node(node, ctx).await?;

        if plan.is_finished() || plan.has_failed() {
            let summary = plan.graph().summary();
            info!(
                role = %self.name,
                completed = summary.completed,
                failed = summary.failed,
                "Plan finished"
            );
            self.ctx.plan = None;
        }
        Ok((self.output_message(tag, &output), output.status))
    }

    /// Optionally fold `message` into the store, then run one
    /// observe -> think -> act pass outside the lifecycle machine.
    pub async fn react(&mut self, message: Option<Message>) -> Result<Option<Message>> {
        if let Some(msg) = message {
            self.store.add(msg).await?;
        }
        let has_news = self.observe().await?;
        if !has_news && !self.has_pending_work() {
            return Ok(None);
        }
        if !self.think().await? {
            return Ok(None);
        }
        Ok(Some(self.act().await?))
    }

    // ── Drivers ─────────────────────────────────────────────────

    /// One externally driven pass under the current policy.
    ///
    /// Reactive runs a tracked idle -> observing -> thinking -> acting -> idle
    /// pass. Ordered runs the next action in registration order. Plan-and-act
    /// plans if needed and runs the next eligible step.
    pub async fn run(&mut self, message: Option<Message>) -> Result<Option<Message>> {
        if let Some(msg) = message {
            self.store.add(msg).await?;
        }
        self.publish(AgentEvent::RunStarted {
            role: self.name.clone(),
        });

        let result = if self.ctx.policy.drives_state_machine() {
            self.tracked_pass().await
        } else {
            self.sequential_pass().await
        };

        match result {
            Ok(produced) => {
                if produced.is_some() {
                    self.ctx.loop_count += 1;
                    self.publish_context();
                }
                self.publish(AgentEvent::RunComplete {
                    role: self.name.clone(),
                    loops: self.ctx.loop_count,
                });
                Ok(produced)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    async fn tracked_pass(&mut self) -> Result<Option<Message>> {
        self.machine.send(LifecycleEvent::Observe)?;
        if !self.observe().await? {
            self.machine.send(LifecycleEvent::Complete)?;
            return Ok(None);
        }
        self.machine.send(LifecycleEvent::Think)?;
        if !self.think().await? {
            self.machine.send(LifecycleEvent::Complete)?;
            return Ok(None);
        }
        self.machine.send(LifecycleEvent::Act)?;
        let message = self.act().await?;
        self.machine.send(LifecycleEvent::Complete)?;
        Ok(Some(message))
    }

    async fn sequential_pass(&mut self) -> Result<Option<Message>> {
        self.observe().await?;
        if !self.think().await? {
            return Ok(None);
        }
        Ok(Some(self.act().await?))
    }

    /// Self-driving loop: feeds lifecycle events from hook outcomes until a
    /// hook reports nothing to do, `max_loop` passes have run, or `stop()`
    /// is called. Returns the messages produced.
    pub async fn start(&mut self) -> Result<Vec<Message>> {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.publish(AgentEvent::RunStarted {
            role: self.name.clone(),
        });
        info!(
            role = %self.name,
            mode = %self.ctx.policy.mode,
            max_loop = self.ctx.policy.max_loop,
            "Role started"
        );

        let mut produced = Vec::new();
        match self.drive(&mut produced).await {
            Ok(()) => {
                self.publish(AgentEvent::RunComplete {
                    role: self.name.clone(),
                    loops: self.ctx.loop_count,
                });
                Ok(produced)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    async fn drive(&mut self, produced: &mut Vec<Message>) -> Result<()> {
        let mut passes = 0;
        self.machine.send(LifecycleEvent::Observe)?;

        loop {
            if self.stopping() {
                break;
            }
            let has_news = self.observe().await?;
            if !has_news && !self.has_pending_work() {
                break;
            }

            if self.stopping() {
                break;
            }
            self.machine.send(LifecycleEvent::Think)?;
            if !self.think().await? {
                break;
            }

            if self.stopping() {
                break;
            }
            self.machine.send(LifecycleEvent::Act)?;
            produced.push(self.act().await?);
            self.finish_pass(&mut passes);

            if self.stopping() || !self.ctx.policy.allows_pass(passes) {
                break;
            }
            self.machine.send(LifecycleEvent::React)?;
            match self.react(None).await? {
                Some(msg) => {
                    produced.push(msg);
                    self.finish_pass(&mut passes);
                }
                None => break,
            }

            if self.stopping() || !self.ctx.policy.allows_pass(passes) {
                break;
            }
            self.machine.send(LifecycleEvent::Observe)?;
        }

        self.machine.send(LifecycleEvent::Complete)?;
        debug!(role = %self.name, passes, "Role loop finished");
        Ok(())
    }

    fn finish_pass(&mut self, passes: &mut usize) {
        *passes += 1;
        self.ctx.loop_count += 1;
        self.publish_context();
    }

    fn stopping(&self) -> bool {
        if self.cancel.is_cancelled() {
            info!(role = %self.name, "Stop requested, halting at state boundary");
            return true;
        }
        false
    }

    /// Work the role can continue without new input: the rest of an ordered
    /// sequence, or the remaining steps of an active plan.
    fn has_pending_work(&self) -> bool {
        match self.ctx.policy.mode {
            ReactMode::React => false,
            ReactMode::ByOrder => {
                self.ctx.order_index > 0 && self.ctx.order_index < self.registry.len()
            }
            ReactMode::PlanAndAct => self
                .ctx
                .plan
                .as_ref()
                .is_some_and(|p| !p.is_finished() && !p.has_failed()),
        }
    }

    fn abort(&mut self, e: TroupeError) -> TroupeError {
        error!(role = %self.name, error = %e, "Lifecycle hook failed");
        if self.machine.state() != LifecycleState::Idle {
            if let Err(send_err) = self.machine.send(LifecycleEvent::Error) {
                warn!(role = %self.name, error = %send_err, "Could not abort lifecycle pass");
            }
        }
        e
    }

    /// Request the loop to halt at the next state boundary. Context is kept.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops this role when cancelled, for use from other tasks.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Back to idle with nothing selected. History and read position are kept.
    pub fn reset(&mut self) -> Result<()> {
        self.machine.reset()?;
        self.ctx.order_index = 0;
        self.set_state(None);
        Ok(())
    }

    pub fn status(&self) -> RoleStatus {
        RoleStatus {
            name: self.name.clone(),
            state: self.machine.state(),
            todo: self.ctx.todo.as_ref().map(|t| t.tag.to_string()),
            loop_count: self.ctx.loop_count,
            react_mode: self.ctx.policy.mode,
            history_len: self.ctx.history.len(),
            plan: self.ctx.plan.as_ref().map(|p| p.graph().summary()),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn set_state(&mut self, state: Option<usize>) {
        self.ctx.state = state;
        self.ctx.todo = state
            .and_then(|i| self.registry.at(i))
            .map(|entry| Todo {
                tag: entry.tag.clone(),
                node: None,
            });
        self.publish_context();
    }

    fn publish_context(&self) {
        self.machine.update_context(
            self.ctx.todo.as_ref().map(|t| t.tag.to_string()),
            self.ctx.loop_count,
            self.ctx.policy.mode,
        );
    }

    fn publish(&self, event: AgentEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    fn action_context(&self) -> ActionContext {
        ActionContext::new(self.name.clone())
            .with_news(self.ctx.news.clone())
            .with_history(self.ctx.history.clone())
    }

    fn selection_input(&self) -> SelectionInput {
        SelectionInput {
            role: self.name.clone(),
            profile: self.profile.clone(),
            goal: self.goal.clone(),
            news: self.ctx.news.clone(),
            history: self.ctx.history.clone(),
            previous: self.ctx.state,
            ..SelectionInput::from_registry(&self.registry)
        }
    }

    fn plan_input(&self) -> PlanInput {
        PlanInput {
            role: self.name.clone(),
            goal: self.goal.clone(),
            actions: self.registry.iter().map(|a| a.action.clone()).collect(),
            news: self.ctx.news.clone(),
            event_bus: self.event_bus.clone(),
        }
    }

    fn output_message(&self, tag: &ActionTag, output: &ActionOutput) -> Message {
        let status = serde_json::json!({ "status": output.status });
        let msg = Message::new(output.content.clone())
            .with_sender(self.name.clone())
            .with_cause_by(tag.clone());
        match output.payload {
            Some(ref payload) => msg.with_payload(payload.clone()).enriched(status),
            None => msg.with_payload(status),
        }
    }
}

/// Run an action once, folding errors into a failed output.
async fn run_once(action: &dyn Action, ctx: ActionContext) -> ActionOutput {
    match action.run(ctx).await {
        Ok(output) => output,
        Err(e) => {
            warn!(action = action.name(), error = %e, "Action raised an error");
            let mut output = action
                .handle_exception(&e)
                .unwrap_or_else(|| ActionOutput::failed(e.to_string()));
            output.status = ActionStatus::Failed;
            output
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::FnAction;
    use crate::planner::{DeclaredPlanner, PlanStep};
    use crate::selector::LlmSelector;
    use troupe_core::types::MessageFilter;
    use troupe_memory::MessageBus;
    use troupe_test_utils::{
        role_message, run_log, user_message, FailingAction, FlakyAction, RecordingAction,
        ScriptedLlm,
    };

    fn bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new())
    }

    async fn outputs_of(store: &MessageBus, role: &str) -> Vec<Message> {
        store
            .search(&MessageFilter::new().sent_from(role))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reactive_run_is_one_tracked_pass_per_message() {
        let store = bus();
        let log = run_log();
        let mut role = Role::new("alice", store.clone())
            .with_config(&AgentConfig {
                max_loop: 3,
                ..AgentConfig::default()
            })
            .with_action(RecordingAction::new("reply", log.clone()))
            .unwrap();

        for text in ["one", "two", "three"] {
            let out = role.run(Some(user_message(text))).await.unwrap();
            assert_eq!(out.unwrap().content(), "reply done");
            assert_eq!(role.state(), LifecycleState::Idle);
        }

        assert_eq!(outputs_of(&store, "alice").await.len(), 3);
        assert_eq!(store.len().await.unwrap(), 6);
        assert_eq!(role.status().loop_count, 3);

        let events: Vec<LifecycleEvent> = role.transitions().iter().map(|t| t.event).collect();
        assert_eq!(
            &events[..4],
            &[
                LifecycleEvent::Observe,
                LifecycleEvent::Think,
                LifecycleEvent::Act,
                LifecycleEvent::Complete
            ]
        );
    }

    #[tokio::test]
    async fn reactive_run_without_news_completes_early() {
        let store = bus();
        let mut role = Role::new("alice", store.clone())
            .with_action(RecordingAction::new("reply", run_log()))
            .unwrap();

        assert!(role.run(None).await.unwrap().is_none());
        assert_eq!(role.state(), LifecycleState::Idle);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn act_wraps_errors_in_message() {
        let store = bus();
        let mut role = Role::new("calc", store.clone())
            .with_action(FailingAction::new("divide"))
            .unwrap();

        let msg = role.run(Some(user_message("1/0"))).await.unwrap().unwrap();
        assert!(msg.content().contains("division by zero"));
        assert_eq!(msg.payload().unwrap()["status"], serde_json::json!("failed"));
        assert_eq!(msg.cause_by().as_str(), "divide");
        assert_eq!(role.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn observe_filters_by_watch_and_address() {
        let store = bus();
        let mut role = Role::new("qa", store.clone())
            .with_action_triggered_by(RecordingAction::new("write_test", run_log()), "write_code")
            .unwrap();

        store.publish(role_message("prd", "pm", "write_prd")).unwrap();
        store.publish(role_message("code", "engineer", "write_code")).unwrap();
        store
            .publish(role_message("psst", "pm", "chat").with_recipient("qa"))
            .unwrap();
        store
            .publish(role_message("not you", "pm", "write_code").with_recipient("engineer"))
            .unwrap();
        store.publish(role_message("mine", "qa", "write_code")).unwrap();

        assert!(role.observe().await.unwrap());
        let news: Vec<&str> = role.context().news.iter().map(|m| m.content()).collect();
        assert_eq!(news, vec!["code", "psst"]);

        // Already-read messages are not news again
        assert!(!role.observe().await.unwrap());
        assert_eq!(role.context().history.len(), 2);
    }

    #[tokio::test]
    async fn watch_all_sees_every_broadcast() {
        let store = bus();
        let mut role = Role::new("observer", store.clone())
            .with_config(&AgentConfig {
                watch_all: true,
                ..AgentConfig::default()
            });
        store.publish(role_message("a", "pm", "anything")).unwrap();
        assert!(role.observe().await.unwrap());
    }

    #[tokio::test]
    async fn trigger_selection_with_several_actions() {
        let store = bus();
        let log = run_log();
        let mut role = Role::new("engineer", store.clone())
            .with_action(RecordingAction::new("write_code", log.clone()))
            .unwrap()
            .with_action_triggered_by(RecordingAction::new("fix_bug", log.clone()), "bug_report")
            .unwrap();

        let out = role
            .run(Some(role_message("crash on start", "qa", "bug_report")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.cause_by().as_str(), "fix_bug");

        let out = role.run(Some(user_message("new feature"))).await.unwrap().unwrap();
        assert_eq!(out.cause_by().as_str(), "write_code");
    }

    #[tokio::test]
    async fn llm_selector_can_decline() {
        let store = bus();
        let llm = Arc::new(ScriptedLlm::new(["-1"]));
        let mut role = Role::new("engineer", store.clone())
            .with_selector(LlmSelector::new(llm))
            .with_action(RecordingAction::new("a", run_log()))
            .unwrap()
            .with_action(RecordingAction::new("b", run_log()))
            .unwrap();

        assert!(role.run(Some(user_message("done already"))).await.unwrap().is_none());
        assert_eq!(role.state(), LifecycleState::Idle);
        assert!(role.context().todo.is_none());
    }

    #[tokio::test]
    async fn ordered_runs_one_action_per_call() {
        let store = bus();
        let log = run_log();
        let mut role = Role::new("writer", store.clone())
            .with_config(&AgentConfig {
                react_mode: ReactMode::ByOrder,
                ..AgentConfig::default()
            })
            .with_action(RecordingAction::new("outline", log.clone()))
            .unwrap()
            .with_action(RecordingAction::new("draft", log.clone()))
            .unwrap();

        let first = role.run(Some(user_message("an essay"))).await.unwrap().unwrap();
        assert_eq!(first.cause_by().as_str(), "outline");
        let second = role.run(None).await.unwrap().unwrap();
        assert_eq!(second.cause_by().as_str(), "draft");
        assert!(role.run(None).await.unwrap().is_none());

        assert_eq!(*log.lock().unwrap(), vec!["outline".to_string(), "draft".to_string()]);
        // Ordered scheduling never touches the state machine
        assert!(role.transitions().is_empty());
    }

    #[tokio::test]
    async fn run_follows_policy_after_mode_switch() {
        let store = bus();
        let mut role = Role::new("alice", store.clone())
            .with_action(RecordingAction::new("reply", run_log()))
            .unwrap();

        role.run(Some(user_message("hi"))).await.unwrap().unwrap();
        assert_eq!(role.transitions().len(), 4);

        role.set_react_mode(ReactMode::ByOrder, 1);
        assert!(!role.policy().drives_state_machine());
        let out = role.run(Some(user_message("again"))).await.unwrap().unwrap();
        assert_eq!(out.cause_by().as_str(), "reply");
        assert_eq!(role.transitions().len(), 4);
        assert_eq!(role.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn plan_and_act_runs_one_step_per_call() {
        let store = bus();
        let log = run_log();
        let mut role = Role::new("engineer", store.clone())
            .with_config(&AgentConfig {
                react_mode: ReactMode::PlanAndAct,
                ..AgentConfig::default()
            })
            .with_planner(DeclaredPlanner::new(vec![
                PlanStep::new("write_test").after("write_code"),
                PlanStep::new("write_code"),
            ]))
            .with_action(RecordingAction::new("write_code", log.clone()))
            .unwrap()
            .with_action(RecordingAction::new("write_test", log.clone()))
            .unwrap();

        let first = role.run(Some(user_message("a cli"))).await.unwrap().unwrap();
        assert_eq!(first.cause_by().as_str(), "write_code");
        assert_eq!(role.status().plan.unwrap().completed, 1);

        let second = role.run(None).await.unwrap().unwrap();
        assert_eq!(second.cause_by().as_str(), "write_test");
        assert!(role.plan().is_none(), "finished plans are dropped");

        assert!(role.run(None).await.unwrap().is_none());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn plan_step_receives_upstream_output() {
        let store = bus();
        let mut role = Role::new("engineer", store.clone())
            .with_config(&AgentConfig {
                react_mode: ReactMode::PlanAndAct,
                max_loop: 5,
                ..AgentConfig::default()
            })
            .with_action(RecordingAction::new("design", run_log()).with_content("use sqlite"))
            .unwrap()
            .with_action(FnAction::new("implement", |ctx: ActionContext| async move {
                let design = ctx.upstream.first().map(|o| o.content.clone()).unwrap_or_default();
                Ok(ActionOutput::completed(format!("implemented: {design}")))
            }))
            .unwrap();

        store.publish(user_message("a todo app")).unwrap();
        let produced = role.start().await.unwrap();
        let contents: Vec<&str> = produced.iter().map(|m| m.content()).collect();
        assert_eq!(contents, vec!["use sqlite", "implemented: use sqlite"]);
    }

    #[tokio::test]
    async fn start_is_bounded_by_max_loop() {
        let store = bus();
        let log = run_log();
        let mut role = Role::new("writer", store.clone())
            .with_config(&AgentConfig {
                react_mode: ReactMode::ByOrder,
                max_loop: 2,
                ..AgentConfig::default()
            })
            .with_action(RecordingAction::new("a", log.clone()))
            .unwrap()
            .with_action(RecordingAction::new("b", log.clone()))
            .unwrap()
            .with_action(RecordingAction::new("c", log.clone()))
            .unwrap();

        store.publish(user_message("go")).unwrap();
        let produced = role.start().await.unwrap();
        assert_eq!(produced.len(), 2);
        assert_eq!(role.state(), LifecycleState::Idle);
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);

        let states: Vec<LifecycleState> = role.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                LifecycleState::Observing,
                LifecycleState::Thinking,
                LifecycleState::Acting,
                LifecycleState::Reacting,
                LifecycleState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn start_completes_when_nothing_to_observe() {
        let store = bus();
        let mut role = Role::new("idle", store)
            .with_action(RecordingAction::new("a", run_log()))
            .unwrap();
        let produced = role.start().await.unwrap();
        assert!(produced.is_empty());
        assert_eq!(role.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn stopped_role_halts_at_boundary_and_keeps_context() {
        let store = bus();
        let log = run_log();
        let role = Role::new("writer", store.clone()).with_config(&AgentConfig {
            react_mode: ReactMode::ByOrder,
            max_loop: 10,
            ..AgentConfig::default()
        });
        let handle = role.stop_handle();
        let mut role = role
            .with_action(FnAction::new("a", move |_ctx: ActionContext| {
                let handle = handle.clone();
                async move {
                    handle.cancel();
                    Ok(ActionOutput::completed("a done"))
                }
            }))
            .unwrap()
            .with_action(RecordingAction::new("b", log.clone()))
            .unwrap()
            .with_action(RecordingAction::new("c", log.clone()))
            .unwrap();

        store.publish(user_message("go")).unwrap();
        let produced = role.start().await.unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(role.state(), LifecycleState::Idle);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(role.context().history.len(), 2);

        // A later start replaces the cancelled token and resumes the sequence
        let produced = role.start().await.unwrap();
        assert_eq!(produced.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn retrying_action_reports_through_message() {
        let store = bus();
        let mut role = Role::new("analyst", store.clone())
            .with_config(&AgentConfig {
                max_retry: 3,
                ..AgentConfig::default()
            })
            .with_retrying_action(FlakyAction::new("run_code", 2))
            .unwrap();

        let msg = role.run(Some(user_message("mean of [1,2,3]"))).await.unwrap().unwrap();
        assert_eq!(msg.content(), "succeeded on attempt 3");

        let failures = store
            .search(&MessageFilter::new().cause_by("run_code").content_contains("failed"))
            .await
            .unwrap();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn set_react_mode_keeps_todo_and_history() {
        let store = bus();
        let mut role = Role::new("alice", store.clone())
            .with_action(RecordingAction::new("reply", run_log()))
            .unwrap();
        role.run(Some(user_message("hi"))).await.unwrap();
        let todo = role.context().todo.clone();
        let history = role.context().history.len();

        role.set_react_mode(ReactMode::ByOrder, 4);
        assert_eq!(role.context().todo, todo);
        assert_eq!(role.context().history.len(), history);
        assert_eq!(role.policy().max_loop, 4);
        assert_eq!(role.status().react_mode, ReactMode::ByOrder);
    }

    #[tokio::test]
    async fn reset_clears_todo_only() {
        let store = bus();
        let mut role = Role::new("alice", store.clone())
            .with_action(RecordingAction::new("reply", run_log()))
            .unwrap();
        role.run(Some(user_message("hi"))).await.unwrap();
        assert!(role.context().todo.is_some());

        role.reset().unwrap();
        assert!(role.context().todo.is_none());
        assert!(role.context().state.is_none());
        assert_eq!(role.context().history.len(), 2);
        assert_eq!(role.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn subscribers_observe_snapshots() {
        let store = bus();
        let mut role = Role::new("alice", store)
            .with_action(RecordingAction::new("reply", run_log()))
            .unwrap();
        let rx = role.subscribe();

        role.run(Some(user_message("hi"))).await.unwrap();
        let snap = rx.borrow().clone();
        assert_eq!(snap.state, LifecycleState::Idle);
        assert_eq!(snap.todo.as_deref(), Some("reply"));
        assert_eq!(snap.loop_count, 1);
    }

    #[tokio::test]
    async fn hook_error_aborts_pass() {
        let store = bus();
        let llm = Arc::new(troupe_test_utils::FailingLlm);
        let mut role = Role::new("engineer", store)
            .with_selector(LlmSelector::new(llm))
            .with_action(RecordingAction::new("a", run_log()))
            .unwrap()
            .with_action(RecordingAction::new("b", run_log()))
            .unwrap();

        let err = role.run(Some(user_message("hi"))).await.unwrap_err();
        assert!(matches!(err, TroupeError::LlmRequest(_)));
        assert_eq!(role.state(), LifecycleState::Idle);
        assert_eq!(
            role.transitions().last().map(|t| t.event),
            Some(LifecycleEvent::Error)
        );
    }
}
