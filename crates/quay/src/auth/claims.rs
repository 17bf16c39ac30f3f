//! JWT claims for browser and API bearers.

use serde::{Deserialize, Serialize};

/// JWT claims structure.
///
/// `sub` is the platform user ID. `session_id` is set on tokens scoped to a
/// single session (not used by the shipped token issuer, but verified peers
/// may present them).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued at (Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Optional session scope.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Claims {
    /// Build claims for a user expiring `ttl_secs` from now.
    pub fn for_user(user_id: &str, ttl_secs: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user_id.to_string(),
            exp: now + ttl_secs,
            iat: Some(now),
            iss: Some("quay".to_string()),
            session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_user_expiry_in_future() {
        let claims = Claims::for_user("u1", 3600);
        assert_eq!(claims.sub, "u1");
        assert!(claims.exp > chrono::Utc::now().timestamp());
        assert_eq!(claims.iss.as_deref(), Some("quay"));
    }

    #[test]
    fn test_claims_roundtrip() {
        let claims = Claims::for_user("u1", 60);
        let json = serde_json::to_string(&claims).unwrap();
        let parsed: Claims = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sub, "u1");
        assert_eq!(parsed.session_id, None);
    }
}
