//! API request handlers.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::Utc;
use log::warn;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::{LaunchSpec, Orchestrator};
use crate::relay::{PhaseExtras, RelayOptions, StartupPhase};
use crate::session::{NewSession, Session, SessionStatus, SessionStore, StatusExtras};

use super::auth::CurrentUser;
use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Session plus the connection coordinates handed out at provisioning.
#[derive(Debug, Serialize)]
pub struct ProvisionedSession {
    pub session: Session,
    /// Served exactly once, here. The agent presents it on its relay socket.
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "relayUrl")]
    pub relay_url: String,
}

fn generate_access_token() -> String {
    use rand::Rng;

    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    const TOKEN_LENGTH: usize = 48;

    let mut rng = rand::rng();
    (0..TOKEN_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// POST /api/sessions
///
/// Provision a session: create the record, create its relay in `launching`,
/// arm the connect timeout, and ask the orchestrator for a worker. Launch
/// failures are not fatal here; the timeout converts a missing worker into a
/// failed session.
pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<NewSession>,
) -> ApiResult<Json<ProvisionedSession>> {
    let session_id = Uuid::new_v4().to_string();
    let access_token = generate_access_token();

    let session = Session {
        id: session_id.clone(),
        user_id: user.id().to_string(),
        status: SessionStatus::Starting,
        access_token: access_token.clone(),
        initial_prompt: request.initial_prompt.clone(),
        worker_context: request.worker_context.clone(),
        capabilities: None,
        result_stats: None,
        created_at: Utc::now(),
        last_activity_at: None,
        stopped_at: None,
        error: None,
    };
    let session = state.sessions.create(session).await?;

    let relay = state.registry.get_or_create(
        &session_id,
        user.id(),
        RelayOptions {
            initial_prompt: request.initial_prompt,
            worker_context: request.worker_context,
        },
    );

    // Bound the launching/connecting window.
    let timeout = Duration::from_secs(state.config.connect_timeout_secs);
    let sessions = state.sessions.clone();
    let relay_for_timeout = relay.clone();
    let timed_out_id = session_id.clone();
    state.timeouts.set(&session_id, timeout, move || async move {
        warn!("Session {} never received its agent", timed_out_id);
        relay_for_timeout.broadcast_startup_phase(
            StartupPhase::Failed,
            PhaseExtras {
                error: Some("Container failed to connect".to_string()),
                capabilities: None,
            },
        );
        if let Err(err) = sessions
            .update_status(
                &timed_out_id,
                SessionStatus::Errored,
                StatusExtras::error("Container failed to connect"),
            )
            .await
        {
            warn!("Failed to mark session {} errored: {}", timed_out_id, err);
        }
    });

    let relay_url = format!("{}/ws/relay/{}", state.config.public_ws_url, session_id);
    let spec = LaunchSpec {
        session_id: session_id.clone(),
        access_token: access_token.clone(),
        relay_url: relay_url.clone(),
        env: HashMap::new(),
    };
    match state.orchestrator.launch(spec).await {
        Ok(task_ref) => {
            state.tasks.insert(session_id.clone(), task_ref);
        }
        Err(err) => {
            // The connect timeout will fail the session if nothing arrives.
            warn!("Worker launch for session {} failed: {}", session_id, err);
        }
    }

    info!("Provisioned session {} for user {}", session_id, user.id());
    Ok(Json(ProvisionedSession {
        session,
        access_token,
        relay_url,
    }))
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<Session>>> {
    let sessions = state.sessions.list_for_user(user.id()).await?;
    Ok(Json(sessions))
}

/// GET /api/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = fetch_owned_session(&state, &user, &session_id).await?;
    Ok(Json(session))
}

/// POST /api/sessions/{session_id}/stop
pub async fn stop_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = fetch_owned_session(&state, &user, &session_id).await?;

    state.timeouts.clear(&session_id);
    if let Some((_, task_ref)) = state.tasks.remove(&session_id) {
        if let Err(err) = state.orchestrator.stop(&task_ref).await {
            warn!("Failed to stop worker for session {}: {}", session_id, err);
        }
    }
    state.registry.remove(&session_id, "Session stopped");

    if !session.is_terminal() {
        state
            .sessions
            .update_status(&session_id, SessionStatus::Stopped, StatusExtras::default())
            .await?;
    }

    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Session {session_id} not found")))?;
    info!("Stopped session {}", session_id);
    Ok(Json(session))
}

/// Fetch a session, hiding its existence from non-owners.
async fn fetch_owned_session(
    state: &AppState,
    user: &CurrentUser,
    session_id: &str,
) -> ApiResult<Session> {
    let session = state
        .sessions
        .get(session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Session {session_id} not found")))?;
    if session.user_id != user.id() {
        return Err(ApiError::not_found(format!("Session {session_id} not found")));
    }
    Ok(session)
}
