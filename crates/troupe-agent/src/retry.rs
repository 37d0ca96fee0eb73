use std::sync::Arc;

use tracing::{info, warn};

use troupe_core::error::Result;
use troupe_core::event::EventBus;
use troupe_core::traits::{Action, MessageStore};
use troupe_core::types::{ActionContext, ActionOutput, AgentEvent, Message};

/// Final report of a bounded retry loop.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// Success or exhaustion report. Not yet appended to the store.
    pub message: Message,
    pub attempts: usize,
    pub succeeded: bool,
}

/// Memory-fed bounded retry.
///
/// Every failed attempt is appended to the store before the next one, so the
/// next attempt's history shows why the previous one failed. Stops at the
/// first success or after `max_retry` attempts; exhaustion is reported as a
/// message, never as an error. Only store failures are returned as `Err`.
pub struct BoundedRetry {
    max_retry: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl BoundedRetry {
    pub fn new(max_retry: usize) -> Self {
        Self {
            max_retry: max_retry.max(1),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn max_retry(&self) -> usize {
        self.max_retry
    }

    pub async fn run(
        &self,
        action: &dyn Action,
        base: ActionContext,
        store: &dyn MessageStore,
        sender: &str,
    ) -> Result<RetryOutcome> {
        let tag = action.tag();
        let mut counter = 0;
        let mut last_error = String::new();

        while counter < self.max_retry {
            let attempt = counter + 1;
            let ctx = base.clone().with_history(store.get().await?);

            let failure = match action.run(ctx).await {
                Ok(output) if output.is_completed() => {
                    if attempt > 1 {
                        info!(action = action.name(), attempt, "Retry succeeded");
                    }
                    let message = report(&output.content, action, sender)
                        .with_payload(serde_json::json!({
                            "status": "completed",
                            "attempts": attempt,
                        }));
                    return Ok(RetryOutcome {
                        message,
                        attempts: attempt,
                        succeeded: true,
                    });
                }
                Ok(output) => output.content,
                Err(e) => action
                    .handle_exception(&e)
                    .map(|o: ActionOutput| o.content)
                    .unwrap_or_else(|| e.to_string()),
            };

            counter += 1;
            warn!(
                action = action.name(),
                attempt,
                max_retry = self.max_retry,
                error = %failure,
                "Attempt failed"
            );
            if let Some(ref bus) = self.event_bus {
                bus.publish(AgentEvent::RetryAttempt {
                    action: action.name().to_string(),
                    attempt,
                    max_retry: self.max_retry,
                    error: failure.clone(),
                });
            }

            let entry = Message::new(format!(
                "{} attempt {attempt} failed: {failure}",
                action.name()
            ))
            .with_sender(sender)
            .with_cause_by(tag.clone())
            .with_recipient(sender)
            .with_payload(serde_json::json!({
                "status": "failed",
                "attempt": attempt,
                "error": failure,
            }));
            store.add(entry).await?;
            last_error = failure;
        }

        warn!(action = action.name(), attempts = counter, "Retries exhausted");
        let message = report(
            &format!(
                "{} failed after {counter} attempts: {last_error}",
                action.name()
            ),
            action,
            sender,
        )
        .with_payload(serde_json::json!({
            "status": "exhausted",
            "attempts": counter,
        }));
        Ok(RetryOutcome {
            message,
            attempts: counter,
            succeeded: false,
        })
    }
}

fn report(content: &str, action: &dyn Action, sender: &str) -> Message {
    Message::new(content)
        .with_sender(sender)
        .with_cause_by(action.tag())
}
