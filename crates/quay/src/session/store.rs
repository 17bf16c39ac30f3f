//! Session and message persistence boundaries.
//!
//! The relay itself is soft-state; durable storage lives behind these traits.
//! The in-memory implementations back the server by default and the test
//! suite throughout. Store failures are logged by callers and never take the
//! relay down.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{NewMessage, Session, SessionStatus, StatusExtras};

/// Durable storage for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session record.
    async fn create(&self, session: Session) -> Result<Session>;

    /// Fetch a session by ID.
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// List sessions owned by a user, newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>>;

    /// Validate a per-session access token.
    ///
    /// Returns the session when the token matches, `None` when the session is
    /// unknown or the token does not match. Comparison is constant-time.
    async fn validate_access_token(&self, session_id: &str, token: &str)
    -> Result<Option<Session>>;

    /// Update a session's status, applying any extras (error, capabilities,
    /// result stats). Terminal statuses also stamp `stopped_at`.
    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        extras: StatusExtras,
    ) -> Result<()>;

    /// Bump the session's last-activity timestamp.
    async fn record_activity(&self, session_id: &str) -> Result<()>;
}

/// Durable storage for conversation messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message to the session's history.
    async fn store(&self, message: NewMessage) -> Result<StoredMessage>;
}

/// A persisted message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredMessage {
    pub id: String,
    #[serde(flatten)]
    pub message: NewMessage,
    pub created_at: chrono::DateTime<Utc>,
}

/// Compare two secrets without leaking the mismatch position.
///
/// Hashing both sides first makes the byte-wise compare run over fixed-length
/// digests regardless of input length.
pub fn constant_time_token_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn validate_access_token(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(session_id) else {
            return Ok(None);
        };
        if constant_time_token_eq(&session.access_token, token) {
            Ok(Some(session.clone()))
        } else {
            Ok(None)
        }
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        extras: StatusExtras,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = status;
            if matches!(status, SessionStatus::Stopped | SessionStatus::Errored) {
                session.stopped_at = Some(Utc::now());
            }
            if let Some(error) = extras.error {
                session.error = Some(error);
            }
            if let Some(capabilities) = extras.capabilities {
                session.capabilities = Some(capabilities);
            }
            if let Some(stats) = extras.result_stats {
                session.result_stats = Some(stats);
            }
        }
        Ok(())
    }

    async fn record_activity(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// In-memory message store.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All messages stored for a session, in append order.
    pub async fn messages_for(&self, session_id: &str) -> Vec<StoredMessage> {
        let messages = self.messages.read().await;
        messages
            .iter()
            .filter(|m| m.message.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, message: NewMessage) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            message,
            created_at: Utc::now(),
        };
        let mut messages = self.messages.write().await;
        messages.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(id: &str, user: &str, token: &str) -> Session {
        Session {
            id: id.to_string(),
            user_id: user.to_string(),
            status: SessionStatus::Starting,
            access_token: token.to_string(),
            initial_prompt: None,
            worker_context: None,
            capabilities: None,
            result_stats: None,
            created_at: Utc::now(),
            last_activity_at: None,
            stopped_at: None,
            error: None,
        }
    }

    #[test]
    fn test_constant_time_token_eq() {
        assert!(constant_time_token_eq("tok", "tok"));
        assert!(!constant_time_token_eq("tok", "tok2"));
        assert!(!constant_time_token_eq("", "tok"));
    }

    #[tokio::test]
    async fn test_validate_access_token() {
        let store = MemorySessionStore::new();
        store
            .create(sample_session("s1", "u1", "secret"))
            .await
            .unwrap();

        assert!(store.validate_access_token("s1", "secret").await.unwrap().is_some());
        assert!(store.validate_access_token("s1", "wrong").await.unwrap().is_none());
        assert!(store.validate_access_token("nope", "secret").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_stamps_stopped_at() {
        let store = MemorySessionStore::new();
        store
            .create(sample_session("s1", "u1", "t"))
            .await
            .unwrap();

        store
            .update_status("s1", SessionStatus::Errored, StatusExtras::error("boom"))
            .await
            .unwrap();

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Errored);
        assert_eq!(session.error.as_deref(), Some("boom"));
        assert!(session.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_list_for_user_filters_and_orders() {
        let store = MemorySessionStore::new();
        store.create(sample_session("s1", "u1", "t")).await.unwrap();
        store.create(sample_session("s2", "u2", "t")).await.unwrap();
        store.create(sample_session("s3", "u1", "t")).await.unwrap();

        let sessions = store.list_for_user("u1").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.user_id == "u1"));
    }

    #[tokio::test]
    async fn test_message_store_append_order() {
        let store = MemoryMessageStore::new();
        store
            .store(NewMessage::new("s1", crate::session::MessageKind::User, "one"))
            .await
            .unwrap();
        store
            .store(NewMessage::new("s1", crate::session::MessageKind::Assistant, "two"))
            .await
            .unwrap();
        store
            .store(NewMessage::new("other", crate::session::MessageKind::User, "x"))
            .await
            .unwrap();

        let messages = store.messages_for("s1").await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.content, "one");
        assert_eq!(messages[1].message.content, "two");
    }
}
