//! Request authentication extractor.

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};
use log::warn;

use crate::auth::Identity;

use super::error::ApiError;
use super::state::AppState;

/// The authenticated caller of a REST request.
///
/// Extracting this verifies the `Authorization: Bearer` header against the
/// configured identity provider.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.user_id
    }
}

/// Pull a bearer token out of the Authorization header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_from_headers(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        match state.identity.verify_bearer(&token).await {
            Ok(verified) => Ok(CurrentUser {
                user_id: verified.user_id,
            }),
            Err(err) => {
                warn!("Bearer verification failed: {}", err);
                Err(ApiError::unauthorized("Authentication failed"))
            }
        }
    }
}
