use std::sync::{Mutex, RwLock};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::MessageStore;
use troupe_core::types::{Message, MessageFilter};

/// In-process, append-only message bus.
///
/// Observers registered with [`MessageBus::subscribe`] receive every message
/// synchronously inside `publish`, in append order. Closed observers are
/// pruned on the next publish.
#[derive(Default)]
pub struct MessageBus {
    messages: RwLock<Vec<Message>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and fan it out to observers.
    pub fn publish(&self, message: Message) -> Result<()> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| TroupeError::Memory(e.to_string()))?;

        // Deliver under the write lock so observers see append order.
        {
            let mut observers = self
                .observers
                .lock()
                .map_err(|e| TroupeError::Memory(e.to_string()))?;
            observers.retain(|tx| tx.send(message.clone()).is_ok());
        }

        debug!(
            id = %message.id(),
            cause_by = %message.cause_by(),
            sent_from = message.sent_from(),
            position = messages.len(),
            "Message published"
        );
        messages.push(message);
        Ok(())
    }

    /// Register an observer for messages published from now on.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .map_err(|e| TroupeError::Memory(e.to_string()))?
            .push(tx);
        Ok(rx)
    }

    /// Copy of the full log, oldest first.
    pub fn snapshot(&self) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .map_err(|e| TroupeError::Memory(e.to_string()))?
            .clone())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self
            .messages
            .read()
            .map_err(|e| TroupeError::Memory(e.to_string()))?
            .len())
    }

    fn tail(&self, offset: usize) -> Result<Vec<Message>> {
        let messages = self
            .messages
            .read()
            .map_err(|e| TroupeError::Memory(e.to_string()))?;
        Ok(messages.get(offset..).map(<[Message]>::to_vec).unwrap_or_default())
    }

    fn filtered(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let messages = self
            .messages
            .read()
            .map_err(|e| TroupeError::Memory(e.to_string()))?;
        Ok(filter.apply(&messages))
    }
}

impl MessageStore for MessageBus {
    fn add(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.publish(message) })
    }

    fn get(&self) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(async move { self.snapshot() })
    }

    fn search(&self, filter: &MessageFilter) -> BoxFuture<'_, Result<Vec<Message>>> {
        let filter = filter.clone();
        Box::pin(async move { self.filtered(&filter) })
    }

    fn len(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { self.count() })
    }

    fn since(&self, offset: usize) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(async move { self.tail(offset) })
    }
}
