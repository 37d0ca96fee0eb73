use troupe_core::config::{AgentConfig, ReactMode};

/// How a role schedules its lifecycle passes: which mode it runs under and
/// how many passes one `start()` may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingPolicy {
    pub mode: ReactMode,
    pub max_loop: usize,
}

impl SchedulingPolicy {
    pub fn new(mode: ReactMode, max_loop: usize) -> Self {
        Self {
            mode,
            max_loop: max_loop.max(1),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.react_mode, config.max_loop)
    }

    /// Whether another pass is allowed after `loops` completed passes.
    pub fn allows_pass(&self, loops: usize) -> bool {
        loops < self.max_loop
    }

    /// Only reactive scheduling branches on the lifecycle machine's events;
    /// the other modes call the hooks in fixed sequence.
    pub fn drives_state_machine(&self) -> bool {
        self.mode == ReactMode::React
    }
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self::new(ReactMode::React, 1)
    }
}
