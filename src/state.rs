use std::time::Duration;

/// Observable state of the engine's poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// No poll loop is running.
    Stopped,
    /// Sleeping until the next cycle.
    Waiting {
        delay: Duration,
        consecutive_failures: u32,
    },
    /// A cycle (fetch + reconcile) is in flight.
    Polling,
    /// Stop requested; the loop exits once the current step finishes.
    Stopping,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Waiting { .. } | EngineState::Polling)
    }
}
