//! Test utilities and common setup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use quay::api::{AppState, RelayConfig, create_router};
use quay::auth::{DevIdentity, DevUser};
use quay::orchestrator::NoopOrchestrator;
use quay::relay::{PhaseExtras, RelayOptions, StartupPhase};
use quay::session::{
    MemoryMessageStore, MemorySessionStore, Session, SessionStatus, SessionStore, StatusExtras,
};

pub const ALICE_TOKEN: &str = "dev-token-alice";
pub const BOB_TOKEN: &str = "dev-token-bob";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Application state wired for tests: in-memory stores, static dev tokens
/// for alice and bob, no orchestrator.
pub fn test_state() -> AppState {
    let identity = Arc::new(DevIdentity::new(vec![
        DevUser {
            user_id: "alice".to_string(),
            token: ALICE_TOKEN.to_string(),
        },
        DevUser {
            user_id: "bob".to_string(),
            token: BOB_TOKEN.to_string(),
        },
    ]));
    AppState::new(
        MemorySessionStore::new(),
        MemoryMessageStore::new(),
        identity,
        Arc::new(NoopOrchestrator::new()),
        RelayConfig::default(),
    )
}

/// Router over fresh test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    (create_router(state.clone()), state)
}

/// Bind the app on an ephemeral port and serve it in the background.
pub async fn spawn_server() -> (SocketAddr, AppState) {
    let (app, state) = test_app();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Provision a session the way the REST handler does: store record, relay in
/// `launching`, connect timeout armed. Returns (session_id, access_token).
pub async fn provision_session(
    state: &AppState,
    user_id: &str,
    initial_prompt: Option<&str>,
    connect_timeout: Duration,
) -> (String, String) {
    let session_id = Uuid::new_v4().to_string();
    let access_token = format!("tok-{}", Uuid::new_v4());

    let session = Session {
        id: session_id.clone(),
        user_id: user_id.to_string(),
        status: SessionStatus::Starting,
        access_token: access_token.clone(),
        initial_prompt: initial_prompt.map(str::to_string),
        worker_context: None,
        capabilities: None,
        result_stats: None,
        created_at: Utc::now(),
        last_activity_at: None,
        stopped_at: None,
        error: None,
    };
    state.sessions.create(session).await.unwrap();

    let relay = state.registry.get_or_create(
        &session_id,
        user_id,
        RelayOptions {
            initial_prompt: initial_prompt.map(str::to_string),
            worker_context: None,
        },
    );

    let sessions = state.sessions.clone();
    let timed_out_id = session_id.clone();
    state
        .timeouts
        .set(&session_id, connect_timeout, move || async move {
            relay.broadcast_startup_phase(
                StartupPhase::Failed,
                PhaseExtras {
                    error: Some("Container failed to connect".to_string()),
                    capabilities: None,
                },
            );
            let _ = sessions
                .update_status(
                    &timed_out_id,
                    SessionStatus::Errored,
                    StatusExtras::error("Container failed to connect"),
                )
                .await;
        });

    (session_id, access_token)
}

/// Connect a browser WebSocket with a bearer token.
pub async fn connect_browser(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws?token={token}&deviceID=test-device");
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connect an agent WebSocket with its session access token.
pub async fn connect_agent(addr: SocketAddr, session_id: &str, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/relay/{session_id}");
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

/// Connect an agent WebSocket without any Authorization header.
pub async fn connect_agent_unauthenticated(addr: SocketAddr, session_id: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/relay/{session_id}");
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Send a JSON object as a text frame.
pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame parsed as JSON, skipping protocol ping/pong. Panics after
/// `timeout` so a hung test fails with a useful message.
pub async fn next_json(ws: &mut WsClient, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for frame");
        let message = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read envelopes until one of the given `type` arrives; returns it.
pub async fn next_envelope_of_type(ws: &mut WsClient, kind: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for envelope of type {kind}"
        );
        let value = next_json(ws, timeout).await;
        if value["type"] == kind {
            return value;
        }
    }
}

/// Read envelopes until a `session_status` with the given startup phase.
pub async fn next_status_with_phase(ws: &mut WsClient, phase: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for session_status with startupPhase {phase}"
        );
        let value = next_json(ws, timeout).await;
        if value["type"] == "session_status" && value["payload"]["startupPhase"] == phase {
            return value;
        }
    }
}

/// Assert that no text frame arrives within the window.
pub async fn expect_silence(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = result {
        panic!("expected silence, got frame: {text}");
    }
}

/// Wait for the close frame and return its code.
pub async fn expect_close(ws: &mut WsClient, timeout: Duration) -> u16 {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for close");
        let message = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for close");
        match message {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) => return 1005,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("socket ended without close frame"),
        }
    }
}

/// Agent-side NDJSON helper: a `system/init` frame.
pub fn init_frame(model: &str, tools: Vec<&str>, cwd: &str) -> Value {
    serde_json::json!({
        "type": "system",
        "subtype": "init",
        "model": model,
        "tools": tools,
        "cwd": cwd,
        "permissionMode": "default",
    })
}

/// Drain `variables` map helper for env tests.
pub fn env_vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
