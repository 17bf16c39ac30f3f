//! Application state shared across handlers.

use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::Identity;
use crate::orchestrator::{Orchestrator, TaskRef};
use crate::relay::{ConnectionTimeouts, RelayRegistry};
use crate::session::{MessageStore, SessionStore};

/// Relay behavior knobs surfaced to the API layer.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Seconds a provisioned session may spend in launching/connecting before
    /// it is failed.
    pub connect_timeout_secs: u64,
    /// WebSocket URL of this relay as reachable from worker containers.
    pub public_ws_url: String,
    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 120,
            public_ws_url: "ws://localhost:8080".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ],
        }
    }
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Durable session records.
    pub sessions: Arc<dyn SessionStore>,
    /// Durable conversation messages.
    pub messages: Arc<dyn MessageStore>,
    /// Bearer verification for browsers and the REST API.
    pub identity: Arc<dyn Identity>,
    /// Worker container orchestration.
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Live relays, one per session.
    pub registry: Arc<RelayRegistry>,
    /// Pending connect timers.
    pub timeouts: Arc<ConnectionTimeouts>,
    /// Orchestrator task handles by session ID.
    pub tasks: Arc<DashMap<String, TaskRef>>,
    /// Relay configuration.
    pub config: RelayConfig,
}

impl AppState {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        identity: Arc<dyn Identity>,
        orchestrator: Arc<dyn Orchestrator>,
        config: RelayConfig,
    ) -> Self {
        Self {
            sessions,
            messages,
            identity,
            orchestrator,
            registry: Arc::new(RelayRegistry::new()),
            timeouts: Arc::new(ConnectionTimeouts::new()),
            tasks: Arc::new(DashMap::new()),
            config,
        }
    }
}
