//! Browser WebSocket endpoint.
//!
//! Browsers connect to `/ws?token=<bearer>` and subscribe to sessions they
//! own. Commands are validated against ownership on every frame; the reply
//! path is envelopes fanned out by the session relay, plus a snapshot and
//! buffered replay at subscription time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;

use quay_protocol::{BrowserCommand, Envelope, EnvelopeKind, PermissionBehavior, ServerFrame};

use crate::api::AppState;
use crate::auth::Identity;
use crate::relay::{BrowserOutbound, BrowserSender, SessionRelay, browser_channel, next_conn_id};
use crate::session::{MessageKind, MessageStore, NewMessage};

/// Interval between protocol-level pings to the browser.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for the pong after a ping.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed text sent to the agent on `session_interrupt`. The agent's real
/// interrupt needs a signal the relay cannot deliver over the socket, so the
/// stop request travels as a user message.
const INTERRUPT_MESSAGE: &str =
    "Please stop what you are doing as soon as possible. The user has requested an interrupt.";

#[derive(Debug, Deserialize)]
pub struct BrowserWsQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "deviceID", alias = "deviceId")]
    device_id: Option<String>,
}

/// WebSocket upgrade handler for the browser endpoint.
///
/// GET /ws?token=<bearer>&deviceID=<opaque>
pub async fn browser_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<BrowserWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_browser_socket(socket, state, query))
}

async fn handle_browser_socket(socket: WebSocket, state: AppState, query: BrowserWsQuery) {
    let Some(token) = query.token else {
        close_with(socket, 4001, "Authentication required").await;
        return;
    };
    let user_id = match state.identity.verify_bearer(&token).await {
        Ok(verified) => verified.user_id,
        Err(err) => {
            warn!("Browser admission rejected: {}", err);
            close_with(socket, 4001, &err.to_string()).await;
            return;
        }
    };

    let conn_id = next_conn_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = browser_channel();
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    info!("Browser connected: user {} (conn {})", user_id, conn_id);

    // Connection-scoped greeting; never buffered.
    let connected = Envelope::new(
        EnvelopeKind::Connected,
        json!({"userId": user_id, "deviceId": query.device_id}),
    );
    let _ = tx.try_send(BrowserOutbound::Envelope(connected));

    // Writer task: owns the sink, serializes all frames, watchdogs liveness
    // with protocol pings.
    let pong_seen = Arc::clone(&last_pong);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // immediate first tick
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(BrowserOutbound::Envelope(envelope)) => {
                            let text: Utf8Bytes = envelope.to_json().into();
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(BrowserOutbound::Pong) => {
                            let text: Utf8Bytes = r#"{"type":"pong"}"#.into();
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(BrowserOutbound::Close { code, reason }) => {
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    let idle = pong_seen
                        .lock()
                        .map(|seen| seen.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if idle > PING_INTERVAL + PONG_TIMEOUT {
                        debug!("Browser missed pong deadline, closing");
                        break;
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut subscriptions: HashSet<String> = HashSet::new();
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<BrowserCommand>(text.as_str()) {
                    Ok(BrowserCommand::Pong) => touch(&last_pong),
                    Ok(command) => {
                        handle_browser_command(
                            &state,
                            &user_id,
                            conn_id,
                            &tx,
                            &mut subscriptions,
                            command,
                        )
                        .await;
                    }
                    Err(err) => {
                        // Malformed browser frames are dropped, not fatal.
                        debug!("Ignoring unparseable browser frame: {}", err);
                    }
                }
            }
            Ok(Message::Pong(_)) => touch(&last_pong),
            Ok(Message::Ping(_)) => {}
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary message from browser conn {}", conn_id);
            }
            Ok(Message::Close(_)) => break,
            Err(err) => {
                debug!("Browser socket error on conn {}: {}", conn_id, err);
                break;
            }
        }
    }

    // The socket owner removes itself from every relay before exiting.
    for session_id in &subscriptions {
        if let Some(relay) = state.registry.get(session_id) {
            relay.detach_browser(conn_id);
        }
    }
    send_task.abort();
    info!("Browser disconnected: user {} (conn {})", user_id, conn_id);
}

fn touch(last_pong: &Arc<Mutex<Instant>>) {
    if let Ok(mut seen) = last_pong.lock() {
        *seen = Instant::now();
    }
}

async fn handle_browser_command(
    state: &AppState,
    user_id: &str,
    conn_id: u64,
    tx: &BrowserSender,
    subscriptions: &mut HashSet<String>,
    command: BrowserCommand,
) {
    match command {
        BrowserCommand::Ping => {
            let _ = tx.try_send(BrowserOutbound::Pong);
        }
        BrowserCommand::Pong => {}

        BrowserCommand::SessionSubscribe {
            session_id,
            last_message_id,
        } => {
            let Some(relay) = state.registry.get(&session_id) else {
                send_error(tx, "SESSION_NOT_FOUND", "Session not found", &session_id);
                return;
            };
            if !relay.owned_by(user_id) {
                warn!(
                    "User {} attempted to subscribe to session {} owned by {}",
                    user_id,
                    session_id,
                    relay.owner_user_id()
                );
                return;
            }
            let subscribed =
                Envelope::new(EnvelopeKind::Subscribed, json!({"sessionId": &session_id}));
            let _ = tx.try_send(BrowserOutbound::Envelope(subscribed));
            relay.subscribe_browser(conn_id, tx.clone(), last_message_id.as_deref());
            subscriptions.insert(session_id);
        }

        BrowserCommand::SessionUnsubscribe { session_id } => {
            if let Some(relay) = state.registry.get(&session_id) {
                relay.detach_browser(conn_id);
            }
            subscriptions.remove(&session_id);
        }

        BrowserCommand::SessionUserMessage {
            session_id,
            content,
        } => {
            let Some(relay) = resolve_relay(state, user_id, session_id.as_deref(), subscriptions)
            else {
                return;
            };
            let sid = relay.session_id().to_string();
            if !relay.agent_send(ServerFrame::user_message(&sid, &content)) {
                warn!("No agent to receive user message for session {}", sid);
            }
            persist(state, NewMessage::new(&sid, MessageKind::User, content.clone())).await;
            relay.broadcast(
                EnvelopeKind::SessionMessage,
                json!({"messageType": "user", "content": content}),
            );
        }

        BrowserCommand::SessionPermissionResponse {
            session_id,
            request_id,
            behavior,
        } => {
            let Some(relay) = resolve_relay(state, user_id, session_id.as_deref(), subscriptions)
            else {
                return;
            };
            // Unknown request IDs are ignored (already resolved or evicted).
            let Some(pending) = relay.take_pending_permission(&request_id) else {
                debug!("Permission response for unknown request {}", request_id);
                return;
            };
            let sid = relay.session_id().to_string();
            let updated_input = match behavior {
                PermissionBehavior::Allow => Some(pending.input.clone()),
                PermissionBehavior::Deny => None,
            };
            relay.agent_send(ServerFrame::permission_response(
                &request_id,
                &behavior.to_string(),
                updated_input,
            ));
            persist(
                state,
                NewMessage::new(&sid, MessageKind::PermissionResponse, behavior.to_string())
                    .with_metadata(json!({
                        "requestId": &request_id,
                        "toolName": &pending.tool_name,
                        "behavior": behavior,
                    })),
            )
            .await;
            relay.broadcast(
                EnvelopeKind::SessionPermissionResolved,
                json!({"requestId": request_id, "behavior": behavior}),
            );
        }

        BrowserCommand::SessionInterrupt { session_id } => {
            let Some(relay) = resolve_relay(state, user_id, session_id.as_deref(), subscriptions)
            else {
                return;
            };
            let sid = relay.session_id().to_string();
            relay.agent_send(ServerFrame::user_message(&sid, INTERRUPT_MESSAGE));
            persist(
                state,
                NewMessage::new(&sid, MessageKind::System, "User interrupted session"),
            )
            .await;
            relay.broadcast(
                EnvelopeKind::SessionMessage,
                json!({"messageType": "system", "content": "User interrupted session"}),
            );
        }

        BrowserCommand::SessionSetPermissionMode { session_id, mode } => {
            let Some(relay) = resolve_relay(state, user_id, session_id.as_deref(), subscriptions)
            else {
                return;
            };
            let sid = relay.session_id().to_string();
            relay.agent_send(ServerFrame::SetPermissionMode {
                permission_mode: mode.clone(),
            });
            persist(
                state,
                NewMessage::new(
                    &sid,
                    MessageKind::System,
                    format!("Permission mode set to {mode}"),
                ),
            )
            .await;
        }

        BrowserCommand::SessionSetModel { session_id, model } => {
            let Some(relay) = resolve_relay(state, user_id, session_id.as_deref(), subscriptions)
            else {
                return;
            };
            let sid = relay.session_id().to_string();
            relay.agent_send(ServerFrame::SetModel {
                model: model.clone(),
            });
            persist(
                state,
                NewMessage::new(&sid, MessageKind::System, format!("Model set to {model}")),
            )
            .await;
        }

        BrowserCommand::SessionUpdateEnv {
            session_id,
            variables,
        } => {
            let Some(relay) = resolve_relay(state, user_id, session_id.as_deref(), subscriptions)
            else {
                return;
            };
            let sid = relay.session_id().to_string();
            // Persist the key names only; values stay off the record.
            let mut keys: Vec<&str> = variables.keys().map(String::as_str).collect();
            keys.sort_unstable();
            let note = format!("Updated environment variables: {}", keys.join(", "));
            relay.agent_send(ServerFrame::UpdateEnvironmentVariables {
                environment_variables: variables,
            });
            persist(state, NewMessage::new(&sid, MessageKind::System, note)).await;
        }
    }
}

/// Resolve the target relay for a command: the explicit session ID if given,
/// otherwise the connection's sole subscription. Ownership mismatches are
/// ignored silently (and logged server-side).
fn resolve_relay(
    state: &AppState,
    user_id: &str,
    session_id: Option<&str>,
    subscriptions: &HashSet<String>,
) -> Option<Arc<SessionRelay>> {
    let sid = match session_id {
        Some(sid) => sid.to_string(),
        None if subscriptions.len() == 1 => subscriptions.iter().next()?.clone(),
        None => {
            debug!("Browser command with no resolvable session target");
            return None;
        }
    };
    let relay = state.registry.get(&sid)?;
    if !relay.owned_by(user_id) {
        warn!(
            "User {} attempted to act on session {} owned by {}",
            user_id,
            sid,
            relay.owner_user_id()
        );
        return None;
    }
    Some(relay)
}

fn send_error(tx: &BrowserSender, code: &str, message: &str, session_id: &str) {
    let envelope = Envelope::new(
        EnvelopeKind::Error,
        json!({"code": code, "message": message, "sessionId": session_id}),
    );
    let _ = tx.try_send(BrowserOutbound::Envelope(envelope));
}

async fn persist(state: &AppState, message: NewMessage) {
    if let Err(err) = state.messages.store(message).await {
        warn!("Message store write failed: {}", err);
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
