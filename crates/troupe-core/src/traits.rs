use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{Result, TroupeError};
use crate::types::*;

/// Unit of work: anything a role or a dependency graph can schedule.
///
/// `run` is invoked at most once per pending-to-running transition. Retrying
/// is the caller's business, never the action's.
pub trait Action: Send + Sync + 'static {
    /// Display name. Not required to be unique; graphs identify nodes by id.
    fn name(&self) -> &str;

    /// Category used for routing and registry lookup. Defaults to the name.
    fn tag(&self) -> ActionTag {
        ActionTag::new(self.name())
    }

    /// Execute the unit of work.
    fn run(&self, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>>;

    /// Called by the owning scheduler when `run` returns an error.
    /// A returned output replaces the raw error text in what gets reported.
    fn handle_exception(&self, error: &TroupeError) -> Option<ActionOutput> {
        let _ = error;
        None
    }
}

/// LLM provider boundary. The core never interprets generated text beyond
/// what a selector or planner explicitly parses.
pub trait LlmClient: Send + Sync + 'static {
    /// Generate a completion for a prompt.
    fn generate(&self, prompt: &str, options: &GenerateOptions) -> BoxFuture<'_, Result<String>>;

    /// Single-turn chat with default options.
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<String>> {
        self.generate(prompt, &GenerateOptions::default())
    }

    /// Streaming variant. Providers without native streaming yield the whole
    /// completion as one chunk.
    fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let fut = self.generate(prompt, options);
        Box::pin(async move {
            let text = fut.await?;
            Ok(futures::stream::once(async move { Ok(text) }).boxed())
        })
    }
}

/// Message store: the ordered, append-only bus shared between roles.
///
/// Implementations must preserve insertion order and never drop an appended
/// entry within a session.
pub trait MessageStore: Send + Sync + 'static {
    /// Append a message.
    fn add(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// All messages, oldest first.
    fn get(&self) -> BoxFuture<'_, Result<Vec<Message>>>;

    /// Messages matching a filter, oldest first.
    fn search(&self, filter: &MessageFilter) -> BoxFuture<'_, Result<Vec<Message>>>;

    /// Number of stored messages.
    fn len(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.get().await?.len()) })
    }

    /// Messages appended at or after position `offset`.
    fn since(&self, offset: usize) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(async move {
            let mut all = self.get().await?;
            if offset >= all.len() {
                return Ok(Vec::new());
            }
            Ok(all.split_off(offset))
        })
    }
}
