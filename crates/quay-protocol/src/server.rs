//! Frames the relay writes to the worker agent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// All frame types the relay may send to an agent, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A user message injected into the conversation.
    User {
        message: UserMessage,
        /// Always present on the wire, `null` for top-level messages.
        parent_tool_use_id: Option<String>,
        session_id: String,
    },

    /// Response to a `control_request`.
    ControlResponse {
        subtype: String,
        request_id: String,
        response: ControlResponseBody,
    },

    /// Cancel an outstanding control request.
    ControlCancelRequest { request_id: String },

    /// Request the agent to interrupt its current turn.
    Interrupt,

    /// Ask the agent to (re)initialize.
    Initialize,

    /// Switch the agent's permission mode.
    SetPermissionMode { permission_mode: String },

    /// Switch the agent's model.
    SetModel { model: String },

    /// Update environment variables inside the worker.
    UpdateEnvironmentVariables {
        environment_variables: HashMap<String, String>,
    },

    /// Heartbeat.
    KeepAlive,
}

impl ServerFrame {
    /// Build a `user` frame for the given session.
    pub fn user_message(session_id: &str, content: &str) -> ServerFrame {
        ServerFrame::User {
            message: UserMessage {
                role: "user".to_string(),
                content: content.to_string(),
            },
            parent_tool_use_id: None,
            session_id: session_id.to_string(),
        }
    }

    /// Build a successful `control_response` for a permission decision.
    pub fn permission_response(
        request_id: &str,
        behavior: &str,
        updated_input: Option<Value>,
    ) -> ServerFrame {
        ServerFrame::ControlResponse {
            subtype: "success".to_string(),
            request_id: request_id.to_string(),
            response: ControlResponseBody {
                behavior: behavior.to_string(),
                updated_input,
                message: None,
            },
        }
    }

    /// Serialize to a single NDJSON line (no trailing newline).
    pub fn to_line(&self) -> String {
        // ServerFrame contains no map with non-string keys, so serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Body of a `user` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: String,
}

/// Body of a `control_response` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponseBody {
    pub behavior: String,
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_frame_wire_shape() {
        let frame = ServerFrame::user_message("s1", "hello");
        let value: Value = serde_json::from_str(&frame.to_line()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["role"], "user");
        assert_eq!(value["message"]["content"], "hello");
        assert_eq!(value["parent_tool_use_id"], Value::Null);
        assert_eq!(value["session_id"], "s1");
    }

    #[test]
    fn test_permission_response_allow_carries_input() {
        let frame =
            ServerFrame::permission_response("r1", "allow", Some(json!({"path": "/a"})));
        let value: Value = serde_json::from_str(&frame.to_line()).unwrap();
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["subtype"], "success");
        assert_eq!(value["request_id"], "r1");
        assert_eq!(value["response"]["behavior"], "allow");
        assert_eq!(value["response"]["updatedInput"], json!({"path": "/a"}));
    }

    #[test]
    fn test_permission_response_deny_omits_input() {
        let frame = ServerFrame::permission_response("r1", "deny", None);
        let value: Value = serde_json::from_str(&frame.to_line()).unwrap();
        assert!(value["response"].get("updatedInput").is_none());
    }

    #[test]
    fn test_keep_alive_shape() {
        let value: Value = serde_json::from_str(&ServerFrame::KeepAlive.to_line()).unwrap();
        assert_eq!(value, json!({"type": "keep_alive"}));
    }

    #[test]
    fn test_set_permission_mode_shape() {
        let frame = ServerFrame::SetPermissionMode {
            permission_mode: "plan".to_string(),
        };
        let value: Value = serde_json::from_str(&frame.to_line()).unwrap();
        assert_eq!(value["type"], "set_permission_mode");
        assert_eq!(value["permission_mode"], "plan");
    }
}
