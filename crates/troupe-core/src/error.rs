use thiserror::Error;

#[derive(Debug, Error)]
pub enum TroupeError {
    // Graph structure errors
    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("Cycle detected in dependency graph: {}", .nodes.join(" -> "))]
    CycleDetected { nodes: Vec<String> },

    // Action errors
    #[error("Action failed: {action}: {message}")]
    ActionFailed { action: String, message: String },

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action already registered: {0}")]
    DuplicateAction(String),

    // Lifecycle errors
    #[error("Invalid lifecycle transition: {event} while {state}")]
    InvalidTransition { state: String, event: String },

    // Planning errors
    #[error("Planning failed: {0}")]
    Planning(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Memory errors
    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TroupeError {
    /// Structural errors are programmer mistakes (bad graph shape) that must
    /// surface to the caller instead of being folded into node or agent status.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TroupeError::NodeNotFound(_)
                | TroupeError::CycleDetected { .. }
                | TroupeError::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TroupeError>;
