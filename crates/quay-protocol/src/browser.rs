//! The JSON envelope protocol spoken with browser clients.
//!
//! Outbound traffic wraps every payload in an [`Envelope`] with a `type`, the
//! raw payload object, and an ISO 8601 timestamp. Inbound frames are a tagged
//! command enum; field names accept both the camelCase spelling browsers send
//! and the snake_case spelling older clients used.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// Outbound envelope (server -> browser)
// ============================================================================

/// Envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Connected,
    Error,
    Subscribed,
    SessionStatus,
    SessionMessage,
    SessionStream,
    SessionPermissionRequest,
    SessionPermissionResolved,
    SessionToolProgress,
    SessionResult,
    SessionControl,
    SessionAuthStatus,
    SessionToolUseSummary,
    SessionRaw,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde's snake_case rendering is the wire name.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{s}")
    }
}

impl EnvelopeKind {
    /// Whether envelopes of this kind go through the relay's replay buffer.
    ///
    /// `connected`, `subscribed`, and `error` are connection-scoped and never
    /// replayed; everything session-scoped is buffered before it is sent.
    pub fn is_buffered(&self) -> bool {
        !matches!(
            self,
            EnvelopeKind::Connected | EnvelopeKind::Subscribed | EnvelopeKind::Error
        )
    }
}

/// One outbound message to a browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a payload, stamping the current time.
    pub fn new(kind: EnvelopeKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Mark this envelope's payload as a buffered replay.
    pub fn decorated_as_replay(mut self, message_id: &str) -> Self {
        if let Value::Object(map) = &mut self.payload {
            map.insert("_buffered".to_string(), Value::Bool(true));
            map.insert(
                "_messageID".to_string(),
                Value::String(message_id.to_string()),
            );
        }
        self
    }
}

// ============================================================================
// Inbound commands (browser -> server)
// ============================================================================

/// Permission decision from a browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

impl std::fmt::Display for PermissionBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionBehavior::Allow => write!(f, "allow"),
            PermissionBehavior::Deny => write!(f, "deny"),
        }
    }
}

/// Commands a browser may send, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserCommand {
    /// Liveness probe from the client.
    Ping,
    /// Response to a server-initiated ping.
    Pong,

    /// Attach to a session's event stream, optionally replaying history.
    #[serde(alias = "subscribe")]
    SessionSubscribe {
        #[serde(rename = "sessionId", alias = "sessionID", alias = "session_id")]
        session_id: String,
        #[serde(
            default,
            rename = "lastMessageId",
            alias = "lastMessageID",
            alias = "last_message_id"
        )]
        last_message_id: Option<String>,
    },

    /// Detach from a session's event stream.
    #[serde(alias = "unsubscribe")]
    SessionUnsubscribe {
        #[serde(rename = "sessionId", alias = "sessionID", alias = "session_id")]
        session_id: String,
    },

    /// Send a user message to the agent.
    SessionUserMessage {
        #[serde(
            default,
            rename = "sessionId",
            alias = "sessionID",
            alias = "session_id"
        )]
        session_id: Option<String>,
        content: String,
    },

    /// Answer a pending permission request.
    SessionPermissionResponse {
        #[serde(
            default,
            rename = "sessionId",
            alias = "sessionID",
            alias = "session_id"
        )]
        session_id: Option<String>,
        #[serde(rename = "requestId", alias = "requestID", alias = "request_id")]
        request_id: String,
        behavior: PermissionBehavior,
    },

    /// Ask the agent to stop what it is doing.
    SessionInterrupt {
        #[serde(
            default,
            rename = "sessionId",
            alias = "sessionID",
            alias = "session_id"
        )]
        session_id: Option<String>,
    },

    /// Switch the agent's permission mode.
    SessionSetPermissionMode {
        #[serde(
            default,
            rename = "sessionId",
            alias = "sessionID",
            alias = "session_id"
        )]
        session_id: Option<String>,
        mode: String,
    },

    /// Switch the agent's model.
    SessionSetModel {
        #[serde(
            default,
            rename = "sessionId",
            alias = "sessionID",
            alias = "session_id"
        )]
        session_id: Option<String>,
        model: String,
    },

    /// Update environment variables inside the worker.
    SessionUpdateEnv {
        #[serde(
            default,
            rename = "sessionId",
            alias = "sessionID",
            alias = "session_id"
        )]
        session_id: Option<String>,
        variables: HashMap<String, String>,
    },
}

impl BrowserCommand {
    /// The session this command targets, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BrowserCommand::Ping | BrowserCommand::Pong => None,
            BrowserCommand::SessionSubscribe { session_id, .. }
            | BrowserCommand::SessionUnsubscribe { session_id } => Some(session_id),
            BrowserCommand::SessionUserMessage { session_id, .. }
            | BrowserCommand::SessionPermissionResponse { session_id, .. }
            | BrowserCommand::SessionInterrupt { session_id }
            | BrowserCommand::SessionSetPermissionMode { session_id, .. }
            | BrowserCommand::SessionSetModel { session_id, .. }
            | BrowserCommand::SessionUpdateEnv { session_id, .. } => session_id.as_deref(),
        }
    }
}
