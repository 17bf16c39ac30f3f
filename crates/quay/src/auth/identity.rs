//! Bearer verification boundary.
//!
//! Browsers and REST callers authenticate with a user bearer; this trait is
//! the seam to the identity provider. The shipped implementations are HS256
//! JWT validation and a static dev-mode table.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;

use crate::session::constant_time_token_eq;

use super::claims::Claims;
use super::config::{AuthConfig, DevUser};

/// A verified bearer.
#[derive(Debug, Clone)]
pub struct Verified {
    pub user_id: String,
    pub session_id: Option<String>,
}

/// Bearer verification errors. Detail is logged server-side; clients only see
/// a close code or 401.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingToken,
    #[error("Authentication failed")]
    InvalidToken,
}

/// Identity provider boundary.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Verify a user bearer token.
    async fn verify_bearer(&self, token: &str) -> Result<Verified, AuthError>;
}

/// HS256 JWT verification against a shared secret.
pub struct JwtIdentity {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issue a token for a user. Used by tests and operator tooling; a real
    /// deployment typically has its IdP mint these.
    pub fn issue(&self, user_id: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let claims = Claims::for_user(user_id, ttl_secs);
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| AuthError::InvalidToken)
    }
}

#[async_trait]
impl Identity for JwtIdentity {
    async fn verify_bearer(&self, token: &str) -> Result<Verified, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(Verified {
            user_id: data.claims.sub,
            session_id: data.claims.session_id,
        })
    }
}

/// Static token table for development mode.
pub struct DevIdentity {
    users: Vec<DevUser>,
}

impl DevIdentity {
    pub fn new(users: Vec<DevUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Identity for DevIdentity {
    async fn verify_bearer(&self, token: &str) -> Result<Verified, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.users
            .iter()
            .find(|user| constant_time_token_eq(&user.token, token))
            .map(|user| Verified {
                user_id: user.user_id.clone(),
                session_id: None,
            })
            .ok_or(AuthError::InvalidToken)
    }
}

/// Build the identity provider matching the auth configuration.
pub fn identity_from_config(
    config: &AuthConfig,
) -> anyhow::Result<std::sync::Arc<dyn Identity>> {
    if config.dev_mode {
        log::warn!("Auth running in development mode with static tokens");
        return Ok(std::sync::Arc::new(DevIdentity::new(config.dev_users.clone())));
    }
    let secret = config
        .resolve_jwt_secret()?
        .ok_or_else(|| anyhow::anyhow!("jwt_secret is required outside dev mode"))?;
    Ok(std::sync::Arc::new(JwtIdentity::new(&secret)))
}
