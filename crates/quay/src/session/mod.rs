//! Session records and their persistence boundaries.

mod models;
mod store;

pub use models::{
    Capabilities, McpServerInfo, MessageKind, NewMessage, NewSession, ResultStats, Session,
    SessionStatus, StatusExtras, ToolInfo,
};
pub use store::{
    MemoryMessageStore, MemorySessionStore, MessageStore, SessionStore, StoredMessage,
    constant_time_token_eq,
};
