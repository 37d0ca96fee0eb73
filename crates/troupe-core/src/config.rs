use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TroupeError};
use crate::types::GenerateOptions;

/// Top-level Troupe configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Scheduling policy a role runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactMode {
    /// One observe/think/act pass per external message, action picked reactively.
    #[default]
    React,
    /// Registered actions run one per call, in registration order.
    ByOrder,
    /// A dependency-ordered plan is built up front and executed step by step.
    PlanAndAct,
}

impl ReactMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactMode::React => "react",
            ReactMode::ByOrder => "by_order",
            ReactMode::PlanAndAct => "plan_and_act",
        }
    }
}

impl std::fmt::Display for ReactMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReactMode {
    type Err = TroupeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "react" | "reactive" => Ok(ReactMode::React),
            "by_order" | "ordered" => Ok(ReactMode::ByOrder),
            "plan_and_act" => Ok(ReactMode::PlanAndAct),
            other => Err(TroupeError::Config(format!("unknown react mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub react_mode: ReactMode,
    /// Upper bound on lifecycle passes per `start()`.
    #[serde(default = "default_max_loop")]
    pub max_loop: usize,
    /// Attempts allowed by bounded retry loops.
    #[serde(default = "default_max_retry")]
    pub max_retry: usize,
    /// Observe every message on the bus regardless of watched tags.
    #[serde(default)]
    pub watch_all: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            react_mode: ReactMode::default(),
            max_loop: default_max_loop(),
            max_retry: default_max_retry(),
            watch_all: false,
        }
    }
}

fn default_max_loop() -> usize { 1 }
fn default_max_retry() -> usize { 3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    /// Per-call options derived from this model section.
    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            model: Some(self.model_id.clone()),
            system: None,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Which message store backs the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: MemoryBackend,
    /// SQLite database file. Supports a leading `~/`.
    #[serde(default = "default_memory_path")]
    pub path: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackend::default(),
            path: default_memory_path(),
        }
    }
}

fn default_memory_path() -> String { "~/.troupe/messages.db".to_string() }

impl MemoryConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TroupeError::ConfigNotFound(path.display().to_string()))?;

        let config = Self::parse(&content)?;
        debug!(path = %path.display(), mode = %config.agent.react_mode, "Config loaded");
        Ok(config)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| TroupeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agent.max_loop == 0 {
            return Err(TroupeError::Config("agent.max_loop must be at least 1".into()));
        }
        if self.agent.max_retry == 0 {
            return Err(TroupeError::Config("agent.max_retry must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference verbatim when unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
