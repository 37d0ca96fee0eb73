//! Per-role lifecycle state machine.
//!
//! States only change through [`LifecycleEvent`]s fed to the pure
//! [`transition`] function; the owning role drives the machine and runs the
//! hook attached to each state it enters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use troupe_core::config::ReactMode;
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::EventBus;
use troupe_core::types::AgentEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Idle,
    Observing,
    Thinking,
    Acting,
    Reacting,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Observing => "observing",
            LifecycleState::Thinking => "thinking",
            LifecycleState::Acting => "acting",
            LifecycleState::Reacting => "reacting",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleEvent {
    Observe,
    Think,
    Act,
    React,
    Complete,
    Error,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Observe => "OBSERVE",
            LifecycleEvent::Think => "THINK",
            LifecycleEvent::Act => "ACT",
            LifecycleEvent::React => "REACT",
            LifecycleEvent::Complete => "COMPLETE",
            LifecycleEvent::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the event is not accepted in `state`.
///
/// `ERROR` aborts any in-flight pass back to idle; idle itself only accepts
/// `OBSERVE`.
pub fn transition(state: LifecycleState, event: LifecycleEvent) -> Option<LifecycleState> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (state, event) {
        (S::Idle, E::Observe) => Some(S::Observing),
        (S::Observing, E::Think) => Some(S::Thinking),
        (S::Thinking, E::Act) => Some(S::Acting),
        (S::Acting, E::React) => Some(S::Reacting),
        (S::Reacting, E::Observe) => Some(S::Observing),
        (S::Idle, _) => None,
        (_, E::Complete | E::Error) => Some(S::Idle),
        _ => None,
    }
}

/// State plus the parts of the role context worth watching from outside.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    /// Tag of the selected unit of work, if any.
    pub todo: Option<String>,
    pub loop_count: usize,
    pub react_mode: ReactMode,
}

/// One accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LifecycleState,
    pub event: LifecycleEvent,
    pub to: LifecycleState,
}

/// Event-driven machine owned by a single role. Subscribers observe every
/// accepted transition through a `watch` channel.
pub struct LifecycleMachine {
    role: String,
    tx: watch::Sender<LifecycleSnapshot>,
    history: Vec<Transition>,
    event_bus: Option<Arc<EventBus>>,
}

impl LifecycleMachine {
    pub fn new(role: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(LifecycleSnapshot::default());
        Self {
            role: role.into(),
            tx,
            history: Vec::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub(crate) fn set_event_bus(&mut self, event_bus: Option<Arc<EventBus>>) {
        self.event_bus = event_bus;
    }

    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    /// Feed an event. Rejected events leave the state untouched.
    pub fn send(&mut self, event: LifecycleEvent) -> Result<LifecycleState> {
        let from = self.state();
        let to = transition(from, event).ok_or_else(|| TroupeError::InvalidTransition {
            state: from.to_string(),
            event: event.to_string(),
        })?;

        self.tx.send_modify(|snap| snap.state = to);
        self.history.push(Transition { from, event, to });
        debug!(role = %self.role, %from, %event, %to, "Lifecycle transition");

        if let Some(ref bus) = self.event_bus {
            bus.publish(AgentEvent::StateChanged {
                role: self.role.clone(),
                from: from.to_string(),
                to: to.to_string(),
                event: event.to_string(),
            });
        }
        Ok(to)
    }

    /// Publish context changes without touching the state.
    pub fn update_context(&self, todo: Option<String>, loop_count: usize, react_mode: ReactMode) {
        self.tx.send_modify(|snap| {
            snap.todo = todo;
            snap.loop_count = loop_count;
            snap.react_mode = react_mode;
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.tx.subscribe()
    }

    /// Every accepted transition, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Return to idle through `COMPLETE` if a pass is in flight.
    pub fn reset(&mut self) -> Result<()> {
        if self.state() != LifecycleState::Idle {
            self.send(LifecycleEvent::Complete)?;
        }
        Ok(())
    }
}
