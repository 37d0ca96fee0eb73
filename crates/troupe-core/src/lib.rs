pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{AppConfig, ReactMode};
pub use error::{Result, TroupeError};
pub use event::EventBus;
pub use traits::{Action, LlmClient, MessageStore};
pub use types::*;
