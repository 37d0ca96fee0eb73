//! Shared mocks and fixtures for Troupe tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{Action, LlmClient};
use troupe_core::types::{ActionContext, ActionOutput, GenerateOptions, Message};

/// Shared, ordered log of which actions ran.
pub type RunLog = Arc<Mutex<Vec<String>>>;

pub fn run_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// LLM client that replays canned replies in order and records prompts.
/// Once the script is exhausted it keeps returning the last reply.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn generate(&self, prompt: &str, _options: &GenerateOptions) -> BoxFuture<'_, Result<String>> {
        let prompt = prompt.to_string();
        Box::pin(async move {
            self.prompts.lock().unwrap().push(prompt);
            let next = self.replies.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            match next {
                Some(reply) => {
                    *last = Some(reply.clone());
                    Ok(reply)
                }
                None => last
                    .clone()
                    .ok_or_else(|| TroupeError::LlmRequest("script exhausted".into())),
            }
        })
    }
}

/// LLM client that always fails.
pub struct FailingLlm;

impl LlmClient for FailingLlm {
    fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> BoxFuture<'_, Result<String>> {
        Box::pin(async { Err(TroupeError::LlmRequest("503 service unavailable".into())) })
    }
}

/// Action that succeeds with fixed content and appends its name to a log.
pub struct RecordingAction {
    name: String,
    content: String,
    log: RunLog,
    calls: AtomicUsize,
}

impl RecordingAction {
    pub fn new(name: impl Into<String>, log: RunLog) -> Self {
        let name = name.into();
        Self {
            content: format!("{name} done"),
            name,
            log,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Action for RecordingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name.clone());
            Ok(ActionOutput::completed(self.content.clone()))
        })
    }
}

/// Action that errors on its first `failures` runs, then succeeds.
/// Each run records how much history it was given.
pub struct FlakyAction {
    name: String,
    failures: usize,
    attempts: AtomicUsize,
    seen_history: Mutex<Vec<usize>>,
}

impl FlakyAction {
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            attempts: AtomicUsize::new(0),
            seen_history: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// History length observed on each attempt.
    pub fn seen_history(&self) -> Vec<usize> {
        self.seen_history.lock().unwrap().clone()
    }
}

impl Action for FlakyAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_history.lock().unwrap().push(ctx.history.len());
            if attempt <= self.failures {
                return Err(TroupeError::ActionFailed {
                    action: self.name.clone(),
                    message: format!("attempt {attempt} failed"),
                });
            }
            Ok(ActionOutput::completed(format!("succeeded on attempt {attempt}")))
        })
    }
}

/// Action that always errors.
pub struct FailingAction {
    name: String,
}

impl FailingAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Action for FailingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move {
            Err(TroupeError::ActionFailed {
                action: self.name.clone(),
                message: "division by zero".into(),
            })
        })
    }
}

/// A user message routed to everyone.
pub fn user_message(content: &str) -> Message {
    Message::new(content)
}

/// A message as if produced by `sender` running the action tagged `cause_by`.
pub fn role_message(content: &str, sender: &str, cause_by: &str) -> Message {
    Message::new(content)
        .with_sender(sender)
        .with_cause_by(cause_by)
}
