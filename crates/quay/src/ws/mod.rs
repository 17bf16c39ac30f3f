//! WebSocket endpoints for agent and browser peers.

mod agent;
mod browser;

pub use agent::agent_ws_handler;
pub use browser::browser_ws_handler;
