pub mod bus;
pub mod store;

pub use bus::MessageBus;
pub use store::SqliteStore;

use std::sync::Arc;

use troupe_core::config::{MemoryBackend, MemoryConfig};
use troupe_core::error::Result;
use troupe_core::traits::MessageStore;

/// Open the message store selected by the `[memory]` config section.
pub fn open_store(config: &MemoryConfig) -> Result<Arc<dyn MessageStore>> {
    match config.backend {
        MemoryBackend::Memory => Ok(Arc::new(MessageBus::new())),
        MemoryBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.resolved_path())?)),
    }
}
