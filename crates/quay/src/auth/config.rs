//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable development mode (static bearer tokens from `dev_users`).
    pub dev_mode: bool,

    /// JWT secret for HS256. Supports `env:VAR_NAME` indirection.
    /// REQUIRED when dev_mode is false.
    pub jwt_secret: Option<String>,

    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,

    /// Development users (only consulted in dev mode).
    pub dev_users: Vec<DevUser>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            // No default JWT secret - must be explicitly configured
            jwt_secret: None,
            dev_users: Vec::new(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ],
        }
    }
}

/// A static development identity: any bearer equal to `token` authenticates
/// as `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevUser {
    pub user_id: String,
    pub token: String,
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var_name) = value.strip_prefix("env:") {
                    match std::env::var(var_name) {
                        Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                        Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                        Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                    }
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }

    /// Validate the configuration for the current mode.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.dev_mode {
            let secret = self.resolve_jwt_secret()?;
            match secret {
                None => return Err(ConfigValidationError::MissingJwtSecret),
                Some(secret) if secret.len() < 32 => {
                    return Err(ConfigValidationError::JwtSecretTooShort);
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Generate a secure random JWT secret.
    pub fn generate_jwt_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error(
        "JWT secret is required when dev_mode is false. Set jwt_secret in config or use env: indirection."
    )]
    MissingJwtSecret,
    #[error("JWT secret is too short (minimum 32 characters)")]
    JwtSecretTooShort,
    #[error("environment variable {0} not found")]
    EnvVarNotFound(String),
    #[error("environment variable {0} is empty")]
    EnvVarEmpty(String),
}
