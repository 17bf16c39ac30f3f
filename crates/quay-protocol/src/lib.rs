//! Canonical protocol types for Quay relay communication.
//!
//! Three vocabularies meet at the relay:
//! - `agent`: NDJSON frames arriving from a worker container over WebSocket.
//! - `server`: frames the relay writes back to the worker.
//! - `browser`: the JSON envelope protocol spoken with browser clients.
//!
//! `ndjson` holds the frame splitter shared by everything that reads the
//! worker wire format.

pub mod agent;
pub mod browser;
pub mod ndjson;
pub mod server;

pub use agent::{AgentFrame, Capabilities, ControlRequest, InitFrame, McpServerInfo, ResultFrame, ToolInfo};
pub use browser::{BrowserCommand, Envelope, EnvelopeKind, PermissionBehavior};
pub use server::{ControlResponseBody, ServerFrame, UserMessage};
