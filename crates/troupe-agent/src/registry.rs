use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::Action;
use troupe_core::types::ActionTag;

/// An action together with how a role should schedule it.
#[derive(Clone)]
pub struct RegisteredAction {
    pub action: Arc<dyn Action>,
    pub tag: ActionTag,
    /// Message causes that make this action the natural next step.
    pub triggers: BTreeSet<ActionTag>,
    /// Run through a bounded retry loop with this many attempts.
    pub max_retry: Option<usize>,
}

impl RegisteredAction {
    pub fn new(action: Arc<dyn Action>) -> Self {
        Self {
            tag: action.tag(),
            action,
            triggers: BTreeSet::new(),
            max_retry: None,
        }
    }

    pub fn triggered_by(mut self, tag: impl Into<ActionTag>) -> Self {
        self.triggers.insert(tag.into());
        self
    }

    pub fn with_max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = Some(max_retry.max(1));
        self
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }
}

impl std::fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("name", &self.name())
            .field("tag", &self.tag)
            .field("triggers", &self.triggers)
            .field("max_retry", &self.max_retry)
            .finish()
    }
}

/// Registry of a role's actions, keyed by tag. Lookup is by exact tag; the
/// registration order is kept since ordered scheduling walks it.
#[derive(Default)]
pub struct ActionRegistry {
    actions: Vec<RegisteredAction>,
    index: HashMap<ActionTag, usize>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. Tags must be unique within a registry.
    pub fn register(&mut self, entry: RegisteredAction) -> Result<()> {
        if self.index.contains_key(&entry.tag) {
            return Err(TroupeError::DuplicateAction(entry.tag.to_string()));
        }
        self.index.insert(entry.tag.clone(), self.actions.len());
        self.actions.push(entry);
        Ok(())
    }

    pub fn get(&self, tag: &ActionTag) -> Option<&RegisteredAction> {
        self.index.get(tag).and_then(|&i| self.actions.get(i))
    }

    /// Look up by tag, failing with `ActionNotFound`.
    pub fn require(&self, tag: &ActionTag) -> Result<&RegisteredAction> {
        self.get(tag)
            .ok_or_else(|| TroupeError::ActionNotFound(tag.to_string()))
    }

    pub fn at(&self, index: usize) -> Option<&RegisteredAction> {
        self.actions.get(index)
    }

    pub fn position(&self, tag: &ActionTag) -> Option<usize> {
        self.index.get(tag).copied()
    }

    /// First action whose triggers include `cause`.
    pub fn triggered_by(&self, cause: &ActionTag) -> Option<usize> {
        self.actions.iter().position(|a| a.triggers.contains(cause))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAction> {
        self.actions.iter()
    }

    /// Tags in registration order.
    pub fn tags(&self) -> Vec<ActionTag> {
        self.actions.iter().map(|a| a.tag.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
