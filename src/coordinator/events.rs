//! Coordinator state and owner-facing events

use std::fmt;
use std::time::Duration;

use crate::protocol::Body;

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    NotStarted,
    Starting,
    Running,
    /// Startup or the channel failed; sends are refused until restarted
    Failed,
    Stopped,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::NotStarted => "not_started",
            CoordinatorState::Starting => "starting",
            CoordinatorState::Running => "running",
            CoordinatorState::Failed => "failed",
            CoordinatorState::Stopped => "stopped",
        }
    }

    /// Control messages may go out
    pub fn is_active(&self) -> bool {
        matches!(self, CoordinatorState::Starting | CoordinatorState::Running)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a peer left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// It announced STOPPING
    Departed,
    /// Nothing heard within the liveness threshold
    TimedOut,
}

/// Delivered to the coordinator's owner
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    StateChanged(CoordinatorState),
    PeerJoined { server_id: String, start_time: i64 },
    PeerLeft { server_id: String, reason: LeaveReason },
    /// Application message from a peer
    Message { from: String, body: Body },
}

/// Static coordinator parameters
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub server_id: String,
    /// `<vendor>_<handle>`
    pub plugin_id: String,
    /// Wait before announcing, so the connection can settle
    pub settle_delay: Duration,
}

impl CoordinatorSettings {
    pub fn new(server_id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            plugin_id: plugin_id.into(),
            settle_delay: Duration::from_millis(1000),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// Plugin identity carried in `pluginId`
pub fn plugin_id(vendor_id: &str, handle: &str) -> String {
    format!("{}_{}", vendor_id, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_id() {
        assert_eq!(plugin_id("acme", "sync"), "acme_sync");
    }

    #[test]
    fn test_active_states() {
        assert!(CoordinatorState::Starting.is_active());
        assert!(CoordinatorState::Running.is_active());
        assert!(!CoordinatorState::Failed.is_active());
        assert!(!CoordinatorState::NotStarted.is_active());
        assert!(!CoordinatorState::Stopped.is_active());
    }
}
