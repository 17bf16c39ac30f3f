//! Agent WebSocket endpoint.
//!
//! Workers connect to `/ws/relay/{session_id}` with their per-session access
//! token and speak NDJSON. Each inbound frame becomes a persisted message
//! and/or a buffered broadcast to the session's browsers; `system/init`
//! drives the startup state machine to ready.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{Value, json};

use quay_protocol::agent::AgentFrame;
use quay_protocol::ndjson::split_frames;
use quay_protocol::{EnvelopeKind, ServerFrame};

use crate::api::{AppState, bearer_from_headers};
use crate::relay::{
    AgentDetach, AgentOutbound, PhaseExtras, RelayOptions, SessionRelay, StartupPhase,
    agent_channel,
};
use crate::session::{
    MessageKind, MessageStore, NewMessage, ResultStats, SessionStatus, SessionStore, StatusExtras,
};

/// WebSocket upgrade handler for the agent endpoint.
///
/// GET /ws/relay/{session_id}
pub async fn agent_ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, session_id, token))
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    token: Option<String>,
) {
    // Admission: auth failures are only visible as close codes.
    let Some(token) = token else {
        close_with(socket, 4001, "Authentication required").await;
        return;
    };
    let session = match state.sessions.validate_access_token(&session_id, &token).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            // Same code for bad token and unknown session.
            warn!("Agent admission rejected for session {}", session_id);
            close_with(socket, 4003, "Authentication failed").await;
            return;
        }
        Err(err) => {
            error!("Session store lookup failed for {}: {}", session_id, err);
            close_with(socket, 1011, "Internal error").await;
            return;
        }
    };

    // The relay normally exists since provisioning; recreating it here makes
    // agent reconnects survive a relay process restart (soft state).
    let relay = state.registry.get_or_create(
        &session_id,
        &session.user_id,
        RelayOptions {
            initial_prompt: session.initial_prompt.clone(),
            worker_context: session.worker_context.clone(),
        },
    );
    state.timeouts.clear(&session_id);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = agent_channel();

    // Writer task owns the sink; everything reaches the socket through the
    // queue, so frames never interleave.
    let writer_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                AgentOutbound::Frame(frame) => {
                    let line: Utf8Bytes = frame.to_line().into();
                    if sender.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                AgentOutbound::Close { code, reason } => {
                    debug!(
                        "Closing agent socket for session {}: {} {}",
                        writer_session, code, reason
                    );
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let attach = relay.attach_agent(tx);
    info!(
        "Agent connected for session {} (conn {})",
        session_id, attach.conn_id
    );

    // The agent refuses to emit system/init until it has a user message, so
    // the initial prompt must go out before anything is awaited from it.
    if let Some(prompt) = attach.initial_prompt {
        deliver_initial_prompt(&state, &relay, &session_id, &prompt).await;
    }

    let mut clean_close = false;
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_agent_payload(&state, &relay, &session_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary message from agent {}", session_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                clean_close = true;
                break;
            }
            Err(err) => {
                warn!("Agent socket error for session {}: {}", session_id, err);
                break;
            }
        }
    }

    send_task.abort();
    match relay.detach_agent(attach.conn_id) {
        AgentDetach::Stale => {
            debug!("Replaced agent socket for session {} exited", session_id);
        }
        AgentDetach::StartupFailure => {
            update_status(
                &state,
                &session_id,
                SessionStatus::Errored,
                StatusExtras::error("Container disconnected during startup"),
            )
            .await;
        }
        AgentDetach::AfterReady => {
            if clean_close {
                update_status(
                    &state,
                    &session_id,
                    SessionStatus::Stopped,
                    StatusExtras::default(),
                )
                .await;
                relay.broadcast(EnvelopeKind::SessionStatus, json!({"status": "stopped"}));
            } else {
                update_status(
                    &state,
                    &session_id,
                    SessionStatus::Errored,
                    StatusExtras::error("Agent connection lost"),
                )
                .await;
                relay.broadcast(
                    EnvelopeKind::SessionStatus,
                    json!({"status": "errored", "error": "Agent connection lost"}),
                );
            }
        }
    }
    info!("Agent disconnected from session {}", session_id);
}

/// Split a WebSocket payload into NDJSON frames and dispatch each.
/// Unparseable frames are skipped; the connection stays up.
async fn handle_agent_payload(
    state: &AppState,
    relay: &SessionRelay,
    session_id: &str,
    payload: &str,
) {
    for frame_text in split_frames(payload) {
        match serde_json::from_str::<Value>(frame_text) {
            Ok(value) => {
                handle_agent_frame(state, relay, session_id, AgentFrame::from_value(value)).await;
            }
            Err(err) => {
                debug!(
                    "Skipping unparseable agent frame for session {}: {}",
                    session_id, err
                );
            }
        }
    }
}

async fn handle_agent_frame(
    state: &AppState,
    relay: &SessionRelay,
    session_id: &str,
    frame: AgentFrame,
) {
    match frame {
        AgentFrame::Init(init) => {
            // At most once; repeats neither alter capabilities nor re-announce.
            let Some(capabilities) = relay.record_init(init) else {
                return;
            };
            state.timeouts.clear(session_id);
            update_status(
                state,
                session_id,
                SessionStatus::Active,
                StatusExtras::capabilities(capabilities.clone()),
            )
            .await;
            relay.broadcast_startup_phase(
                StartupPhase::Ready,
                PhaseExtras {
                    error: None,
                    capabilities: Some(capabilities),
                },
            );
            info!("Session {} is ready", session_id);
        }

        AgentFrame::Assistant(value) => {
            let content = normalize_content(
                value
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .or_else(|| value.get("content")),
            );
            persist(
                state,
                NewMessage::new(session_id, MessageKind::Assistant, content.clone()),
            )
            .await;
            if let Err(err) = state.sessions.record_activity(session_id).await {
                warn!("Failed to record activity for {}: {}", session_id, err);
            }
            relay.broadcast(
                EnvelopeKind::SessionMessage,
                json!({
                    "messageType": "assistant",
                    "content": content,
                    "message": value.get("message"),
                }),
            );
        }

        AgentFrame::StreamEvent(value) => {
            relay.broadcast(EnvelopeKind::SessionStream, value);
        }

        AgentFrame::ControlRequest(request) => {
            let request_id = request.request_id.clone();
            let subtype = request.subtype().map(str::to_string);
            match subtype.as_deref() {
                Some("can_use_tool") => {
                    let Some(permission) = request.as_permission() else {
                        relay.broadcast(
                            EnvelopeKind::SessionControl,
                            json!({
                                "subtype": "can_use_tool",
                                "requestId": request_id,
                                "request": request.payload(),
                            }),
                        );
                        return;
                    };
                    relay.add_pending_permission(&request_id, permission.clone());
                    persist(
                        state,
                        NewMessage::new(
                            session_id,
                            MessageKind::PermissionRequest,
                            permission.tool_name.clone(),
                        )
                        .with_metadata(json!({
                            "requestId": &request_id,
                            "toolName": &permission.tool_name,
                            "toolUseId": &permission.tool_use_id,
                            "input": &permission.input,
                            "decisionReason": &permission.decision_reason,
                        })),
                    )
                    .await;
                    relay.broadcast(
                        EnvelopeKind::SessionPermissionRequest,
                        json!({
                            "requestId": request_id,
                            "toolName": permission.tool_name,
                            "toolUseId": permission.tool_use_id,
                            "input": permission.input,
                            "reason": permission.decision_reason,
                        }),
                    );
                }
                Some("hook_callback") => {
                    persist(
                        state,
                        NewMessage::new(session_id, MessageKind::System, "Hook callback")
                            .with_metadata(request.payload().clone()),
                    )
                    .await;
                    relay.broadcast(
                        EnvelopeKind::SessionControl,
                        json!({
                            "subtype": "hook_callback",
                            "requestId": request_id,
                            "request": request.payload(),
                        }),
                    );
                }
                other => {
                    relay.broadcast(
                        EnvelopeKind::SessionControl,
                        json!({
                            "subtype": other,
                            "requestId": request_id,
                            "request": request.payload(),
                        }),
                    );
                }
            }
        }

        AgentFrame::ToolProgress(value) => {
            relay.broadcast(EnvelopeKind::SessionToolProgress, value);
        }

        AgentFrame::Result(result) => {
            let stats = ResultStats {
                result_type: result.result_type.clone(),
                duration_ms: result.duration_ms,
                cost_usd: result.cost_usd,
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
            };
            if result.is_error() {
                update_status(
                    state,
                    session_id,
                    SessionStatus::Errored,
                    StatusExtras {
                        error: result.result_type.clone(),
                        capabilities: None,
                        result_stats: Some(stats.clone()),
                    },
                )
                .await;
            } else {
                update_status(
                    state,
                    session_id,
                    SessionStatus::Active,
                    StatusExtras::stats(stats.clone()),
                )
                .await;
            }
            persist(
                state,
                NewMessage::new(session_id, MessageKind::System, "Turn completed")
                    .with_metadata(serde_json::to_value(&stats).unwrap_or(Value::Null)),
            )
            .await;
            relay.broadcast(EnvelopeKind::SessionResult, result.raw);
        }

        AgentFrame::KeepAlive => {
            debug!("Agent keep-alive for session {}", session_id);
        }

        AgentFrame::AuthStatus(value) => {
            relay.broadcast(EnvelopeKind::SessionAuthStatus, value);
        }

        AgentFrame::ToolUseSummary(value) => {
            persist(
                state,
                NewMessage::new(
                    session_id,
                    MessageKind::ToolUse,
                    normalize_content(Some(&value)),
                ),
            )
            .await;
            relay.broadcast(EnvelopeKind::SessionToolUseSummary, value);
        }

        AgentFrame::Raw(value) => {
            relay.broadcast(EnvelopeKind::SessionRaw, value);
        }
    }
}

async fn deliver_initial_prompt(
    state: &AppState,
    relay: &SessionRelay,
    session_id: &str,
    prompt: &str,
) {
    if !relay.agent_send(ServerFrame::user_message(session_id, prompt)) {
        warn!(
            "Could not queue initial prompt for session {}",
            session_id
        );
        return;
    }
    persist(state, NewMessage::new(session_id, MessageKind::User, prompt)).await;
    relay.broadcast(
        EnvelopeKind::SessionMessage,
        json!({"messageType": "user", "content": prompt}),
    );
}

/// Normalize agent message content to a string; structured content is
/// JSON-encoded.
fn normalize_content(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

async fn persist(state: &AppState, message: NewMessage) {
    if let Err(err) = state.messages.store(message).await {
        warn!("Message store write failed: {}", err);
    }
}

async fn update_status(
    state: &AppState,
    session_id: &str,
    status: SessionStatus,
    extras: StatusExtras,
) {
    if let Err(err) = state.sessions.update_status(session_id, status, extras).await {
        warn!(
            "Failed to update session {} status to {}: {}",
            session_id, status, err
        );
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from(reason.to_string()),
        })))
        .await;
}
