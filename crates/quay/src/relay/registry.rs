//! Process-wide map of live session relays.
//!
//! The registry exclusively owns relay lifetimes: relays are created here on
//! first need and only leave memory through [`RelayRegistry::remove`] or
//! [`RelayRegistry::shutdown_all`].

use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use super::relay::{RelayOptions, SessionRelay};

/// Registry of live relays, keyed by session ID.
#[derive(Default)]
pub struct RelayRegistry {
    relays: DashMap<String, Arc<SessionRelay>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent create: an existing relay is returned untouched.
    pub fn get_or_create(
        &self,
        session_id: &str,
        owner_user_id: &str,
        options: RelayOptions,
    ) -> Arc<SessionRelay> {
        self.relays
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Creating relay for session {}", session_id);
                Arc::new(SessionRelay::new(session_id, owner_user_id, options))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionRelay>> {
        self.relays.get(session_id).map(|entry| entry.clone())
    }

    /// Shut the relay down and erase it.
    pub fn remove(&self, session_id: &str, reason: &str) -> Option<Arc<SessionRelay>> {
        let (_, relay) = self.relays.remove(session_id)?;
        relay.shutdown(reason);
        Some(relay)
    }

    /// Snapshot of all live relays.
    pub fn all(&self) -> Vec<Arc<SessionRelay>> {
        self.relays.iter().map(|entry| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Shut down every relay (process exit).
    pub fn shutdown_all(&self, reason: &str) {
        let session_ids: Vec<String> = self.relays.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            self.remove(&session_id, reason);
        }
    }
}
