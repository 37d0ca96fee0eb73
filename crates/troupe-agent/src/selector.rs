//! Picking the next unit of work for reactive scheduling.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use tracing::{debug, warn};

use troupe_core::error::Result;
use troupe_core::traits::LlmClient;
use troupe_core::types::{ActionTag, GenerateOptions, Message};

use crate::registry::ActionRegistry;

/// One selectable action as seen by a selector.
#[derive(Debug, Clone)]
pub struct ActionChoice {
    pub tag: ActionTag,
    pub name: String,
    pub triggers: BTreeSet<ActionTag>,
}

/// Everything a selector may base its decision on.
#[derive(Debug, Clone, Default)]
pub struct SelectionInput {
    pub role: String,
    pub profile: String,
    pub goal: String,
    pub choices: Vec<ActionChoice>,
    /// Messages observed this pass.
    pub news: Vec<Message>,
    pub history: Vec<Message>,
    /// Index chosen last time, if any.
    pub previous: Option<usize>,
}

impl SelectionInput {
    pub fn from_registry(registry: &ActionRegistry) -> Self {
        Self {
            choices: registry
                .iter()
                .map(|a| ActionChoice {
                    tag: a.tag.clone(),
                    name: a.name().to_string(),
                    triggers: a.triggers.clone(),
                })
                .collect(),
            ..Self::default()
        }
    }
}

/// Chooses which registered action runs next.
///
/// `Ok(None)` means there is nothing to do this pass.
pub trait Selector: Send + Sync + 'static {
    fn select(&self, input: SelectionInput) -> BoxFuture<'_, Result<Option<usize>>>;
}

/// Routes on the newest observed message's cause: the first action that lists
/// it as a trigger wins, otherwise the first registered action.
pub struct TriggerSelector;

impl Selector for TriggerSelector {
    fn select(&self, input: SelectionInput) -> BoxFuture<'_, Result<Option<usize>>> {
        Box::pin(async move {
            if input.choices.is_empty() {
                return Ok(None);
            }
            let cause = input
                .news
                .last()
                .or_else(|| input.history.last())
                .map(|m| m.cause_by().clone());

            let picked = cause
                .and_then(|c| input.choices.iter().position(|a| a.triggers.contains(&c)))
                .unwrap_or(0);
            Ok(Some(picked))
        })
    }
}

/// Asks an LLM to pick a numbered action. A reply of `-1`, a number out of
/// range, or no number at all means there is nothing to do.
pub struct LlmSelector {
    llm: Arc<dyn LlmClient>,
    options: GenerateOptions,
}

impl LlmSelector {
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

    fn prompt(input: &SelectionInput) -> String {
        let mut prompt = format!("You are {}", input.role);
        if !input.profile.is_empty() {
            prompt.push_str(&format!(", a {}", input.profile));
        }
        prompt.push_str(".\n");
        if !input.goal.is_empty() {
            prompt.push_str(&format!("Your goal is: {}\n", input.goal));
        }

        prompt.push_str("\n## Conversation so far\n");
        if input.history.is_empty() {
            prompt.push_str("(empty)\n");
        }
        for msg in &input.history {
            prompt.push_str(&format!("{}: {}\n", msg.sent_from(), msg.content()));
        }

        if let Some(prev) = input.previous {
            prompt.push_str(&format!("\nYour previous step was {prev}.\n"));
        }

        prompt.push_str("\n## Available steps\n");
        for (i, choice) in input.choices.iter().enumerate() {
            prompt.push_str(&format!("{i}. {}\n", choice.name));
        }
        prompt.push_str(
            "\nReply with only the number of the step to take next, \
             or -1 if the goal is already met.\n",
        );
        prompt
    }
}

/// First integer in `reply`, if any.
pub fn parse_choice(reply: &str) -> Option<i64> {
    let re = Regex::new(r"-?\d+").ok()?;
    re.find(reply).and_then(|m| m.as_str().parse().ok())
}

impl Selector for LlmSelector {
    fn select(&self, input: SelectionInput) -> BoxFuture<'_, Result<Option<usize>>> {
        Box::pin(async move {
            let prompt = Self::prompt(&input);
            let reply = self.llm.generate(&prompt, &self.options).await?;

            let picked = match parse_choice(&reply) {
                Some(n) if n >= 0 && (n as usize) < input.choices.len() => Some(n as usize),
                Some(-1) => None,
                Some(n) => {
                    warn!(role = %input.role, choice = n, "Selector picked an out-of-range step");
                    None
                }
                None => {
                    warn!(role = %input.role, reply = %reply, "Selector reply had no step number");
                    None
                }
            };
            debug!(role = %input.role, ?picked, "LLM selected next step");
            Ok(picked)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_test_utils::{role_message, ScriptedLlm};

    fn choices(specs: &[(&str, &[&str])]) -> Vec<ActionChoice> {
        specs
            .iter()
            .map(|(tag, triggers)| ActionChoice {
                tag: ActionTag::new(*tag),
                name: tag.to_string(),
                triggers: triggers.iter().map(|t| ActionTag::new(*t)).collect(),
            })
            .collect()
    }

    #[test]
    fn parse_first_integer() {
        assert_eq!(parse_choice("1"), Some(1));
        assert_eq!(parse_choice("I would pick 2, then 0"), Some(2));
        assert_eq!(parse_choice("-1"), Some(-1));
        assert_eq!(parse_choice("nothing"), None);
    }

    #[tokio::test]
    async fn trigger_selector_follows_cause() {
        let input = SelectionInput {
            choices: choices(&[("write_code", &["design"]), ("write_test", &["write_code"])]),
            news: vec![role_message("main.rs", "engineer", "write_code")],
            ..SelectionInput::default()
        };
        assert_eq!(TriggerSelector.select(input).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn trigger_selector_falls_back_to_first() {
        let input = SelectionInput {
            choices: choices(&[("a", &[]), ("b", &["x"])]),
            news: vec![Message::new("hello")],
            ..SelectionInput::default()
        };
        assert_eq!(TriggerSelector.select(input).await.unwrap(), Some(0));
        assert_eq!(
            TriggerSelector.select(SelectionInput::default()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn llm_selector_parses_reply() {
        let llm = Arc::new(ScriptedLlm::new(["1", "-1", "7", "dunno"]));
        let selector = LlmSelector::new(llm.clone());
        let input = SelectionInput {
            role: "Alice".into(),
            goal: "ship it".into(),
            choices: choices(&[("write_code", &[]), ("write_test", &[])]),
            ..SelectionInput::default()
        };

        assert_eq!(selector.select(input.clone()).await.unwrap(), Some(1));
        assert_eq!(selector.select(input.clone()).await.unwrap(), None);
        assert_eq!(selector.select(input.clone()).await.unwrap(), None);
        assert_eq!(selector.select(input).await.unwrap(), None);

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("0. write_code"));
        assert!(prompt.contains("1. write_test"));
        assert!(prompt.contains("ship it"));
    }
}
