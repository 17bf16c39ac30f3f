//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use quay_protocol::agent::{Capabilities, McpServerInfo, ToolInfo};

/// Session status as recorded in the session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Worker is being provisioned and has not completed startup.
    Starting,
    /// Agent is connected and initialized.
    Active,
    /// Session ended normally.
    Stopped,
    /// Session failed during startup or crashed.
    Errored,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Errored => write!(f, "errored"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "active" => Ok(SessionStatus::Active),
            "stopped" => Ok(SessionStatus::Stopped),
            "errored" => Ok(SessionStatus::Errored),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// Per-turn result statistics reported by the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// A relay session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// User who owns this session.
    pub user_id: String,
    /// Current status.
    pub status: SessionStatus,
    /// Per-session capability token the agent presents when connecting.
    /// Never serialized to browsers.
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Prompt delivered to the agent once, on first connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    /// Free-form context handed to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_context: Option<String>,
    /// Capabilities learned from the agent's init frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Stats from the most recent completed turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_stats: Option<ResultStats>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last time the agent produced activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When the session stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Error message if the session errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    /// Whether the session has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Stopped | SessionStatus::Errored)
    }
}

/// Fields for provisioning a new session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSession {
    #[serde(default, rename = "initialPrompt", alias = "initial_prompt")]
    pub initial_prompt: Option<String>,
    #[serde(default, rename = "workerContext", alias = "worker_context")]
    pub worker_context: Option<String>,
}

/// Extra fields attached to a status update.
#[derive(Debug, Clone, Default)]
pub struct StatusExtras {
    pub error: Option<String>,
    pub capabilities: Option<Capabilities>,
    pub result_stats: Option<ResultStats>,
}

impl StatusExtras {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities: Some(capabilities),
            ..Default::default()
        }
    }

    pub fn stats(stats: ResultStats) -> Self {
        Self {
            result_stats: Some(stats),
            ..Default::default()
        }
    }
}

/// Message kinds persisted to the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    ToolUse,
    PermissionRequest,
    PermissionResponse,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::User => write!(f, "user"),
            MessageKind::Assistant => write!(f, "assistant"),
            MessageKind::System => write!(f, "system"),
            MessageKind::ToolUse => write!(f, "tool_use"),
            MessageKind::PermissionRequest => write!(f, "permission_request"),
            MessageKind::PermissionResponse => write!(f, "permission_response"),
        }
    }
}

/// A message to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub session_id: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn new(session_id: &str, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Starting.to_string(), "starting");
        assert_eq!(SessionStatus::Errored.to_string(), "errored");
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("active".parse::<SessionStatus>().unwrap(), SessionStatus::Active);
        assert_eq!("Stopped".parse::<SessionStatus>().unwrap(), SessionStatus::Stopped);
        assert!("running".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_access_token_never_serialized() {
        let session = Session {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            status: SessionStatus::Starting,
            access_token: "secret-token".to_string(),
            initial_prompt: None,
            worker_context: None,
            capabilities: None,
            result_stats: None,
            created_at: Utc::now(),
            last_activity_at: None,
            stopped_at: None,
            error: None,
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("access_token"));
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::ToolUse.to_string(), "tool_use");
        assert_eq!(MessageKind::PermissionRequest.to_string(), "permission_request");
    }
}
