//! Ready-made units of work.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use troupe_core::error::Result;
use troupe_core::traits::{Action, LlmClient};
use troupe_core::types::{ActionContext, ActionOutput, ActionTag, GenerateOptions};

type ActionFn = dyn Fn(ActionContext) -> BoxFuture<'static, Result<ActionOutput>> + Send + Sync;

/// Action backed by an async closure.
pub struct FnAction {
    name: String,
    tag: Option<ActionTag>,
    f: Box<ActionFn>,
}

impl FnAction {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            tag: None,
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<ActionTag>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl Action for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> ActionTag {
        self.tag
            .clone()
            .unwrap_or_else(|| ActionTag::new(self.name.as_str()))
    }

    fn run(&self, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        (self.f)(ctx)
    }
}

/// Action that always completes with the same content.
pub struct StaticAction {
    name: String,
    content: String,
}

impl StaticAction {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

impl Action for StaticAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move { Ok(ActionOutput::completed(self.content.clone())) })
    }
}

/// Fills a prompt template and returns the model's reply.
///
/// `{input}` is replaced by the latest observed content, `{role}` by the
/// running role's name, and `{upstream}` by completed predecessors' outputs.
pub struct LlmAction {
    name: String,
    template: String,
    llm: Arc<dyn LlmClient>,
    options: GenerateOptions,
}

impl LlmAction {
    pub fn new(name: impl Into<String>, template: impl Into<String>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            llm,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    fn render(&self, ctx: &ActionContext) -> String {
        let upstream: Vec<&str> = ctx.upstream.iter().map(|o| o.content.as_str()).collect();
        self.template
            .replace("{input}", ctx.latest_content().unwrap_or_default())
            .replace("{role}", &ctx.role)
            .replace("{upstream}", &upstream.join("\n\n"))
    }
}

impl Action for LlmAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: ActionContext) -> BoxFuture<'_, Result<ActionOutput>> {
        Box::pin(async move {
            let prompt = self.render(&ctx);
            let reply = self.llm.generate(&prompt, &self.options).await?;
            Ok(ActionOutput::completed(reply))
        })
    }
}
