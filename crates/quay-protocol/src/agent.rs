//! Frames arriving from a worker agent over the NDJSON WebSocket wire.
//!
//! The wire uses a string `type` discriminator plus, for `system` frames, a
//! `subtype`. Decoding is two-phase: the raw object is inspected for its
//! discriminators first, then decoded into the matching variant. Anything the
//! relay does not recognize falls through to [`AgentFrame::Raw`] and is
//! forwarded to browsers untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Inbound frame sum type
// ============================================================================

/// A decoded frame from the agent wire.
#[derive(Debug, Clone)]
pub enum AgentFrame {
    /// `system` / `init`: the agent announces itself and its capabilities.
    Init(InitFrame),
    /// A completed assistant message.
    Assistant(Value),
    /// A streaming delta event, forwarded verbatim.
    StreamEvent(Value),
    /// A control request (permission prompt, hook callback, ...).
    ControlRequest(ControlRequest),
    /// Progress report for a running tool.
    ToolProgress(Value),
    /// End-of-turn result with stats.
    Result(ResultFrame),
    /// Wire-level heartbeat.
    KeepAlive,
    /// Authentication status report.
    AuthStatus(Value),
    /// Summary of a completed tool use.
    ToolUseSummary(Value),
    /// Any frame the relay does not model; forwarded as-is.
    Raw(Value),
}

impl AgentFrame {
    /// Decode a single wire object.
    ///
    /// Known `type` values with malformed bodies degrade to [`AgentFrame::Raw`]
    /// rather than failing the connection; the relay forwards what it cannot
    /// interpret.
    pub fn from_value(value: Value) -> AgentFrame {
        let frame_type = value.get("type").and_then(Value::as_str).unwrap_or("");

        match frame_type {
            "system" => {
                let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
                if subtype == "init" {
                    match serde_json::from_value::<InitFrame>(value.clone()) {
                        Ok(init) => AgentFrame::Init(init),
                        Err(_) => AgentFrame::Raw(value),
                    }
                } else {
                    AgentFrame::Raw(value)
                }
            }
            "assistant" => AgentFrame::Assistant(value),
            "stream_event" => AgentFrame::StreamEvent(value),
            "control_request" => match serde_json::from_value::<ControlRequest>(value.clone()) {
                Ok(req) => AgentFrame::ControlRequest(req),
                Err(_) => AgentFrame::Raw(value),
            },
            "tool_progress" => AgentFrame::ToolProgress(value),
            "result" => AgentFrame::Result(ResultFrame::from_value(value)),
            "keep_alive" => AgentFrame::KeepAlive,
            "auth_status" => AgentFrame::AuthStatus(value),
            "tool_use_summary" => AgentFrame::ToolUseSummary(value),
            _ => AgentFrame::Raw(value),
        }
    }
}

// ============================================================================
// system/init
// ============================================================================

/// The `system`/`init` frame body.
///
/// `permissionMode` is preferred on the wire but agents have shipped the
/// snake_case spelling too, so both are captured and merged.
#[derive(Debug, Clone, Deserialize)]
pub struct InitFrame {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "permissionMode")]
    permission_mode_camel: Option<String>,
    #[serde(default, rename = "permission_mode")]
    permission_mode_snake: Option<String>,
    #[serde(default, rename = "agentVersion", alias = "agent_version", alias = "version")]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(default, rename = "mcp_servers", alias = "mcpServers")]
    pub mcp_servers: Vec<McpServerInfo>,
}

impl InitFrame {
    /// Effective permission mode, camelCase spelling winning over snake_case.
    pub fn permission_mode(&self) -> Option<&str> {
        self.permission_mode_camel
            .as_deref()
            .or(self.permission_mode_snake.as_deref())
    }

    /// Convert into the capability record stored on the session.
    pub fn into_capabilities(self) -> Capabilities {
        let permission_mode = self.permission_mode().map(str::to_string);
        Capabilities {
            cwd: self.cwd,
            model: self.model,
            permission_mode,
            agent_version: self.agent_version,
            tools: self.tools,
            mcp_servers: self.mcp_servers,
        }
    }
}

/// A tool declared by the agent.
///
/// The wire may carry either `"ToolName"` or `{"name": "ToolName", "kind": ...}`;
/// both normalize to this struct, preserving declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ToolInfoWire")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolInfoWire {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        kind: Option<String>,
    },
}

impl From<ToolInfoWire> for ToolInfo {
    fn from(wire: ToolInfoWire) -> Self {
        match wire {
            ToolInfoWire::Name(name) => ToolInfo { name, kind: None },
            ToolInfoWire::Full { name, kind } => ToolInfo { name, kind },
        }
    }
}

/// An MCP server declared by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Declared feature set of a running agent, learned once from `system`/`init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerInfo>,
}

// ============================================================================
// control_request
// ============================================================================

/// A `control_request` frame.
///
/// Newer agents nest the payload under `request`; older ones flatten it onto
/// the frame itself. [`ControlRequest::payload`] hides the difference.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub request_id: String,
    #[serde(default)]
    pub request: Option<Value>,
    #[serde(flatten)]
    rest: Value,
}

impl ControlRequest {
    /// The request body: the nested `request` object when present, otherwise
    /// the flattened remainder of the frame.
    pub fn payload(&self) -> &Value {
        self.request.as_ref().unwrap_or(&self.rest)
    }

    /// The request subtype (`can_use_tool`, `hook_callback`, ...).
    pub fn subtype(&self) -> Option<&str> {
        self.payload().get("subtype").and_then(Value::as_str)
    }

    /// Decode the `can_use_tool` fields, if this is a permission request.
    pub fn as_permission(&self) -> Option<PermissionRequest> {
        if self.subtype() != Some("can_use_tool") {
            return None;
        }
        let p = self.payload();
        Some(PermissionRequest {
            tool_name: p
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_use_id: p
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            input: p.get("input").cloned().unwrap_or(Value::Null),
            decision_reason: p
                .get("decision_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// The fields of a `can_use_tool` control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
}

// ============================================================================
// result
// ============================================================================

/// An end-of-turn `result` frame with extracted stats.
#[derive(Debug, Clone)]
pub struct ResultFrame {
    /// `result_type` when present, else `subtype`.
    pub result_type: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// The full original frame, forwarded to browsers.
    pub raw: Value,
}

impl ResultFrame {
    fn from_value(value: Value) -> Self {
        let result_type = value
            .get("result_type")
            .or_else(|| value.get("subtype"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let duration_ms = value.get("duration_ms").and_then(Value::as_u64);
        let cost_usd = value
            .get("total_cost_usd")
            .or_else(|| value.get("cost_usd"))
            .and_then(Value::as_f64);
        let usage = value.get("usage");
        let input_tokens = usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64);
        let output_tokens = usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64);
        ResultFrame {
            result_type,
            duration_ms,
            cost_usd,
            input_tokens,
            output_tokens,
            raw: value,
        }
    }

    /// Whether this result reports an error (`error_max_turns`, ...).
    pub fn is_error(&self) -> bool {
        self.result_type
            .as_deref()
            .is_some_and(|t| t.starts_with("error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_frame_decodes() {
        let frame = AgentFrame::from_value(json!({
            "type": "system",
            "subtype": "init",
            "cwd": "/hq",
            "model": "m",
            "permissionMode": "default",
            "tools": ["t1"],
        }));
        let AgentFrame::Init(init) = frame else {
            panic!("expected init frame");
        };
        assert_eq!(init.cwd.as_deref(), Some("/hq"));
        assert_eq!(init.model.as_deref(), Some("m"));
        assert_eq!(init.permission_mode(), Some("default"));
        assert_eq!(init.tools, vec![ToolInfo { name: "t1".into(), kind: None }]);
    }

    #[test]
    fn test_tools_normalize_from_both_shapes() {
        let strings: InitFrame =
            serde_json::from_value(json!({"tools": ["a", "b"]})).unwrap();
        let objects: InitFrame =
            serde_json::from_value(json!({"tools": [{"name": "a"}, {"name": "b"}]})).unwrap();
        assert_eq!(strings.tools, objects.tools);
        assert_eq!(strings.tools[0].name, "a");
        assert_eq!(strings.tools[1].name, "b");
    }

    #[test]
    fn test_tool_order_preserved() {
        let init: InitFrame = serde_json::from_value(json!({
            "tools": [{"name": "z", "kind": "mcp"}, "a", {"name": "m"}],
        }))
        .unwrap();
        let names: Vec<&str> = init.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
        assert_eq!(init.tools[0].kind.as_deref(), Some("mcp"));
    }

    #[test]
    fn test_permission_mode_snake_case_accepted() {
        let init: InitFrame =
            serde_json::from_value(json!({"permission_mode": "plan"})).unwrap();
        assert_eq!(init.permission_mode(), Some("plan"));
    }

    #[test]
    fn test_permission_mode_camel_preferred() {
        let init: InitFrame = serde_json::from_value(json!({
            "permissionMode": "default",
            "permission_mode": "plan",
        }))
        .unwrap();
        assert_eq!(init.permission_mode(), Some("default"));
    }

    #[test]
    fn test_control_request_nested_payload() {
        let frame = AgentFrame::from_value(json!({
            "type": "control_request",
            "request_id": "r1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Read",
                "input": {"path": "/a"},
            },
        }));
        let AgentFrame::ControlRequest(req) = frame else {
            panic!("expected control_request");
        };
        assert_eq!(req.request_id, "r1");
        let perm = req.as_permission().unwrap();
        assert_eq!(perm.tool_name, "Read");
        assert_eq!(perm.input, json!({"path": "/a"}));
    }

    #[test]
    fn test_control_request_flattened_payload() {
        let frame = AgentFrame::from_value(json!({
            "type": "control_request",
            "request_id": "r2",
            "subtype": "can_use_tool",
            "tool_name": "Bash",
            "input": {"command": "ls"},
        }));
        let AgentFrame::ControlRequest(req) = frame else {
            panic!("expected control_request");
        };
        assert_eq!(req.subtype(), Some("can_use_tool"));
        assert_eq!(req.as_permission().unwrap().tool_name, "Bash");
    }

    #[test]
    fn test_result_error_detection() {
        let frame = AgentFrame::from_value(json!({
            "type": "result",
            "subtype": "error_max_turns",
            "duration_ms": 1200,
            "total_cost_usd": 0.05,
            "usage": {"input_tokens": 10, "output_tokens": 20},
        }));
        let AgentFrame::Result(result) = frame else {
            panic!("expected result");
        };
        assert!(result.is_error());
        assert_eq!(result.duration_ms, Some(1200));
        assert_eq!(result.input_tokens, Some(10));
        assert_eq!(result.output_tokens, Some(20));
    }

    #[test]
    fn test_unknown_type_falls_through_to_raw() {
        let original = json!({"type": "telemetry", "data": 42});
        let frame = AgentFrame::from_value(original.clone());
        let AgentFrame::Raw(raw) = frame else {
            panic!("expected raw frame");
        };
        assert_eq!(raw, original);
    }

    #[test]
    fn test_system_without_init_subtype_is_raw() {
        let frame = AgentFrame::from_value(json!({"type": "system", "subtype": "warning"}));
        assert!(matches!(frame, AgentFrame::Raw(_)));
    }
}
