use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing target meaning "every role on the bus".
pub const ROUTE_TO_ALL: &str = "<all>";

/// `cause_by` / `sent_from` value for input that entered from outside any role.
pub const USER_INPUT: &str = "user";

/// Unique message identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Explicit category of a unit of work. Messages record the tag of the action
/// that produced them, and roles watch tags to decide what to observe.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ActionTag(pub String);

impl ActionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tag carried by externally supplied input.
    pub fn user_input() -> Self {
        Self(USER_INPUT.to_string())
    }
}

impl From<&str> for ActionTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ActionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable record on the message bus.
///
/// Messages are built with the consuming `with_*` methods before being
/// published. Once appended they are only ever handed out as clones;
/// [`Message::enriched`] derives a new value instead of editing in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    content: String,
    cause_by: ActionTag,
    sent_from: String,
    send_to: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// A message from outside any role, broadcast to everyone.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            cause_by: ActionTag::user_input(),
            sent_from: USER_INPUT.to_string(),
            send_to: BTreeSet::new(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_cause_by(mut self, tag: impl Into<ActionTag>) -> Self {
        self.cause_by = tag.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sent_from = sender.into();
        self
    }

    /// Add a recipient. A message with no recipients is broadcast.
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.send_to.insert(recipient.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Clone this message with `extra` merged into its payload object.
    /// Non-object payloads are replaced by `extra`.
    pub fn enriched(&self, extra: serde_json::Value) -> Self {
        let mut next = self.clone();
        next.payload = match (next.payload.take(), extra) {
            (Some(serde_json::Value::Object(mut base)), serde_json::Value::Object(add)) => {
                base.extend(add);
                Some(serde_json::Value::Object(base))
            }
            (_, extra) => Some(extra),
        };
        next
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn cause_by(&self) -> &ActionTag {
        &self.cause_by
    }

    pub fn sent_from(&self) -> &str {
        &self.sent_from
    }

    pub fn send_to(&self) -> &BTreeSet<String> {
        &self.send_to
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the message is routed to everyone.
    pub fn is_broadcast(&self) -> bool {
        self.send_to.is_empty() || self.send_to.contains(ROUTE_TO_ALL)
    }

    /// Whether the message is explicitly routed to `name` (or broadcast).
    pub fn is_addressed_to(&self, name: &str) -> bool {
        self.is_broadcast() || self.send_to.contains(name)
    }
}

/// Query over the message bus. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub cause_by: Option<ActionTag>,
    pub sent_from: Option<String>,
    pub send_to: Option<String>,
    pub content_contains: Option<String>,
    /// Keep only the newest `limit` matches (still returned oldest first).
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cause_by(mut self, tag: impl Into<ActionTag>) -> Self {
        self.cause_by = Some(tag.into());
        self
    }

    pub fn sent_from(mut self, sender: impl Into<String>) -> Self {
        self.sent_from = Some(sender.into());
        self
    }

    pub fn send_to(mut self, recipient: impl Into<String>) -> Self {
        self.send_to = Some(recipient.into());
        self
    }

    pub fn content_contains(mut self, needle: impl Into<String>) -> Self {
        self.content_contains = Some(needle.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(ref tag) = self.cause_by {
            if msg.cause_by() != tag {
                return false;
            }
        }
        if let Some(ref sender) = self.sent_from {
            if msg.sent_from() != sender {
                return false;
            }
        }
        if let Some(ref recipient) = self.send_to {
            if !msg.is_addressed_to(recipient) {
                return false;
            }
        }
        if let Some(ref needle) = self.content_contains {
            if !msg.content().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }

    /// Apply the filter to an ordered slice, honoring `limit`.
    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        let mut matched: Vec<Message> = messages
            .iter()
            .filter(|m| self.matches(m))
            .cloned()
            .collect();
        if let Some(limit) = self.limit {
            if matched.len() > limit {
                let excess = matched.len() - limit;
                matched.drain(..excess);
            }
        }
        matched
    }
}

/// Outcome status reported by a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Completed,
    Failed,
    /// The unit of work could not proceed yet; the scheduler leaves it pending.
    Blocked,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Result of running a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub content: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ActionOutput {
    pub fn completed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: ActionStatus::Completed,
            payload: None,
        }
    }

    pub fn failed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: ActionStatus::Failed,
            payload: None,
        }
    }

    pub fn blocked(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: ActionStatus::Blocked,
            payload: None,
        }
    }

    /// The result of executing an empty graph.
    pub fn empty() -> Self {
        Self::completed("")
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == ActionStatus::Completed
    }
}

/// Input handed to a unit of work when it runs.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    /// Name of the role running the action (empty for bare graph execution).
    pub role: String,
    /// Messages observed in the current pass.
    pub news: Vec<Message>,
    /// Everything the role has seen so far, oldest first.
    pub history: Vec<Message>,
    /// Outputs of completed graph predecessors, in predecessor order.
    pub upstream: Vec<ActionOutput>,
}

impl ActionContext {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_news(mut self, news: Vec<Message>) -> Self {
        self.news = news;
        self
    }

    /// Most recent input text: newest observed message, else newest history
    /// entry, else the last upstream output.
    pub fn latest_content(&self) -> Option<&str> {
        self.news
            .last()
            .or_else(|| self.history.last())
            .map(|m| m.content())
            .or_else(|| self.upstream.last().map(|o| o.content.as_str()))
    }
}

/// Options passed to [`crate::traits::LlmClient::generate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: None,
            system: None,
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

/// Event broadcast to all subscribers of the [`crate::event::EventBus`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A role started a run.
    RunStarted { role: String },
    /// The lifecycle machine accepted a transition.
    StateChanged {
        role: String,
        from: String,
        to: String,
        event: String,
    },
    /// A unit of work started.
    ActionStarted { role: String, action: String },
    /// A unit of work finished.
    ActionFinished {
        role: String,
        action: String,
        status: ActionStatus,
    },
    /// A graph node changed status.
    NodeStatusChanged {
        node_id: String,
        name: String,
        status: String,
    },
    /// A bounded retry loop recorded a failed attempt.
    RetryAttempt {
        action: String,
        attempt: usize,
        max_retry: usize,
        error: String,
    },
    /// A role finished a run.
    RunComplete { role: String, loops: usize },
}
