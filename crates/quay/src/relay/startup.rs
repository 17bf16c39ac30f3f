//! Startup phase state machine.
//!
//! Every session walks `launching -> initializing -> ready` (then the phase is
//! cleared and the session is simply active), or drops into `failed` when the
//! worker never arrives or dies mid-startup. `connecting` is what the
//! orchestrator reports while a connect is in flight and is treated exactly
//! like `launching`.

use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;

/// Ephemeral lifecycle stage of a session's container/agent bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupPhase {
    Launching,
    Connecting,
    Initializing,
    Ready,
    Failed,
}

impl StartupPhase {
    /// The externally visible session status implied by this phase.
    pub fn derived_status(&self) -> SessionStatus {
        match self {
            StartupPhase::Ready => SessionStatus::Active,
            StartupPhase::Failed => SessionStatus::Errored,
            _ => SessionStatus::Starting,
        }
    }

    /// Whether the agent has not yet completed initialization.
    pub fn is_pre_ready(&self) -> bool {
        matches!(
            self,
            StartupPhase::Launching | StartupPhase::Connecting | StartupPhase::Initializing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StartupPhase::Launching => "launching",
            StartupPhase::Connecting => "connecting",
            StartupPhase::Initializing => "initializing",
            StartupPhase::Ready => "ready",
            StartupPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_status() {
        assert_eq!(StartupPhase::Launching.derived_status(), SessionStatus::Starting);
        assert_eq!(StartupPhase::Connecting.derived_status(), SessionStatus::Starting);
        assert_eq!(StartupPhase::Initializing.derived_status(), SessionStatus::Starting);
        assert_eq!(StartupPhase::Ready.derived_status(), SessionStatus::Active);
        assert_eq!(StartupPhase::Failed.derived_status(), SessionStatus::Errored);
    }

    #[test]
    fn test_pre_ready() {
        assert!(StartupPhase::Launching.is_pre_ready());
        assert!(StartupPhase::Connecting.is_pre_ready());
        assert!(StartupPhase::Initializing.is_pre_ready());
        assert!(!StartupPhase::Ready.is_pre_ready());
        assert!(!StartupPhase::Failed.is_pre_ready());
    }

    #[test]
    fn test_wire_spelling() {
        assert_eq!(StartupPhase::Initializing.to_string(), "initializing");
        assert_eq!(
            serde_json::to_value(StartupPhase::Failed).unwrap(),
            serde_json::json!("failed")
        );
    }
}
