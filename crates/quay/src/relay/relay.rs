//! The per-session multiplexer.
//!
//! A relay pairs at most one agent socket with any number of browser sockets.
//! It is a passive object guarded by a mutex; peer tasks call into it and the
//! lock is never held across an await. Network writes go through per-peer
//! bounded queues, so fan-out can never block on a slow socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};

use quay_protocol::agent::PermissionRequest;
use quay_protocol::{Capabilities, Envelope, EnvelopeKind, InitFrame, ServerFrame};

use super::buffer::MessageBuffer;
use super::startup::StartupPhase;

/// Seconds between keep-alive frames to the agent.
const KEEP_ALIVE_INTERVAL_SECS: u64 = 30;

/// Queue depth for frames headed to the agent socket.
const AGENT_QUEUE_SIZE: usize = 64;

/// Queue depth for envelopes headed to one browser socket. Sized to absorb a
/// full replay burst (buffer capacity) plus live traffic without blocking.
pub const BROWSER_QUEUE_SIZE: usize = 2048;

/// Upper bound on outstanding permission requests; oldest are dropped beyond
/// this so a misbehaving agent cannot grow the map without bound.
const MAX_PENDING_PERMISSIONS: usize = 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique peer connection ID.
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Messages queued to an agent socket's writer task.
#[derive(Debug)]
pub enum AgentOutbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

/// Messages queued to a browser socket's writer task.
#[derive(Debug)]
pub enum BrowserOutbound {
    Envelope(Envelope),
    /// JSON-level pong answering a client `ping` frame.
    Pong,
    Close { code: u16, reason: String },
}

pub type AgentSender = mpsc::Sender<AgentOutbound>;
pub type BrowserSender = mpsc::Sender<BrowserOutbound>;

/// Create the bounded queue for an agent writer task.
pub fn agent_channel() -> (AgentSender, mpsc::Receiver<AgentOutbound>) {
    mpsc::channel(AGENT_QUEUE_SIZE)
}

/// Create the bounded queue for a browser writer task.
pub fn browser_channel() -> (BrowserSender, mpsc::Receiver<BrowserOutbound>) {
    mpsc::channel(BROWSER_QUEUE_SIZE)
}

/// Options applied when a relay is first created.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    pub initial_prompt: Option<String>,
    pub worker_context: Option<String>,
}

/// Result of binding an agent socket.
#[derive(Debug)]
pub struct AgentAttach {
    /// Connection ID the socket owner must pass back on detach.
    pub conn_id: u64,
    /// One-shot initial prompt; the caller delivers it before anything else.
    pub initial_prompt: Option<String>,
    /// Whether an older agent socket was displaced.
    pub replaced: bool,
}

/// What an agent detach meant for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentDetach {
    /// The closing socket had already been replaced; nothing to do.
    Stale,
    /// The agent died mid-startup; the relay broadcast `failed`.
    StartupFailure,
    /// The agent closed after the session was fully up.
    AfterReady,
}

/// Extras carried on a startup-phase broadcast.
#[derive(Debug, Clone, Default)]
pub struct PhaseExtras {
    pub error: Option<String>,
    pub capabilities: Option<Capabilities>,
}

struct AgentLink {
    conn_id: u64,
    tx: AgentSender,
}

struct RelayInner {
    agent: Option<AgentLink>,
    browsers: HashMap<u64, BrowserSender>,
    pending_permissions: HashMap<String, PermissionRequest>,
    pending_order: VecDeque<String>,
    initialized: bool,
    capabilities: Option<Capabilities>,
    initial_prompt: Option<String>,
    worker_context: Option<String>,
    buffer: MessageBuffer,
    keep_alive: Option<JoinHandle<()>>,
    startup_phase: Option<StartupPhase>,
    startup_phase_started_at: DateTime<Utc>,
}

/// In-memory state for one live session.
pub struct SessionRelay {
    session_id: String,
    owner_user_id: String,
    inner: Mutex<RelayInner>,
}

impl SessionRelay {
    pub fn new(session_id: &str, owner_user_id: &str, options: RelayOptions) -> Self {
        Self {
            session_id: session_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            inner: Mutex::new(RelayInner {
                agent: None,
                browsers: HashMap::new(),
                pending_permissions: HashMap::new(),
                pending_order: VecDeque::new(),
                initialized: false,
                capabilities: None,
                initial_prompt: options.initial_prompt,
                worker_context: options.worker_context,
                buffer: MessageBuffer::new(),
                keep_alive: None,
                startup_phase: Some(StartupPhase::Launching),
                startup_phase_started_at: Utc::now(),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    pub fn owned_by(&self, user_id: &str) -> bool {
        self.owner_user_id == user_id
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_agent(&self) -> bool {
        self.lock().agent.is_some()
    }

    pub fn initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn startup_phase(&self) -> Option<StartupPhase> {
        self.lock().startup_phase
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.lock().capabilities.clone()
    }

    pub fn worker_context(&self) -> Option<String> {
        self.lock().worker_context.clone()
    }

    pub fn browser_count(&self) -> usize {
        self.lock().browsers.len()
    }

    // ========================================================================
    // Agent side
    // ========================================================================

    /// Bind an agent socket, displacing any previous one.
    ///
    /// Starts the keep-alive ticker, moves a pre-ready session into
    /// `initializing`, and hands back the one-shot initial prompt for the
    /// caller to deliver before anything else reaches the agent.
    pub fn attach_agent(&self, tx: AgentSender) -> AgentAttach {
        let conn_id = next_conn_id();
        let mut replaced = false;
        let phase_change;
        let initial_prompt;
        {
            let mut inner = self.lock();
            if let Some(old) = inner.agent.take() {
                replaced = true;
                let _ = old.tx.try_send(AgentOutbound::Close {
                    code: 1000,
                    reason: "Replaced by new connection".to_string(),
                });
            }
            if let Some(handle) = inner.keep_alive.take() {
                handle.abort();
            }
            inner.agent = Some(AgentLink {
                conn_id,
                tx: tx.clone(),
            });
            inner.keep_alive = Some(spawn_keep_alive(self.session_id.clone(), tx));

            phase_change = match inner.startup_phase {
                Some(StartupPhase::Launching) | Some(StartupPhase::Connecting) => {
                    Some(StartupPhase::Initializing)
                }
                _ => None,
            };
            initial_prompt = inner.initial_prompt.take();
        }

        if let Some(phase) = phase_change {
            self.broadcast_startup_phase(phase, PhaseExtras::default());
        }

        info!(
            "Agent attached to session {} (conn {}, replaced: {})",
            self.session_id, conn_id, replaced
        );
        AgentAttach {
            conn_id,
            initial_prompt,
            replaced,
        }
    }

    /// Unbind an agent socket.
    ///
    /// A detach during startup fails the session and broadcasts exactly one
    /// `failed` status; a detach from a replaced (stale) socket is a no-op.
    pub fn detach_agent(&self, conn_id: u64) -> AgentDetach {
        let failed_startup;
        {
            let mut inner = self.lock();
            match &inner.agent {
                Some(link) if link.conn_id == conn_id => {}
                _ => return AgentDetach::Stale,
            }
            inner.agent = None;
            if let Some(handle) = inner.keep_alive.take() {
                handle.abort();
            }
            failed_startup = inner
                .startup_phase
                .is_some_and(|phase| phase.is_pre_ready());
        }

        if failed_startup {
            self.broadcast_startup_phase(
                StartupPhase::Failed,
                PhaseExtras {
                    error: Some("Container disconnected during startup".to_string()),
                    capabilities: None,
                },
            );
            AgentDetach::StartupFailure
        } else {
            AgentDetach::AfterReady
        }
    }

    /// Queue a frame to the agent socket. Returns false when no agent is
    /// connected or its queue is unwritable.
    pub fn agent_send(&self, frame: ServerFrame) -> bool {
        let inner = self.lock();
        match &inner.agent {
            Some(link) => link.tx.try_send(AgentOutbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Record the agent's init frame.
    ///
    /// Returns the normalized capabilities the first time; `None` on repeat
    /// init frames, which must not alter capabilities or re-broadcast.
    pub fn record_init(&self, init: InitFrame) -> Option<Capabilities> {
        let mut inner = self.lock();
        if inner.initialized {
            debug!(
                "Ignoring repeated system/init for session {}",
                self.session_id
            );
            return None;
        }
        inner.initialized = true;
        let capabilities = init.into_capabilities();
        inner.capabilities = Some(capabilities.clone());
        Some(capabilities)
    }

    // ========================================================================
    // Browser side
    // ========================================================================

    /// Attach a browser socket: current-state snapshot first, then buffered
    /// replay strictly after `last_message_id`, then live events. The three
    /// runs cannot interleave because subscription holds the relay lock that
    /// every broadcast needs.
    pub fn subscribe_browser(
        &self,
        conn_id: u64,
        tx: BrowserSender,
        last_message_id: Option<&str>,
    ) {
        let mut inner = self.lock();
        inner.browsers.insert(conn_id, tx.clone());

        let snapshot = Envelope::new(EnvelopeKind::SessionStatus, snapshot_payload(&inner, &self.session_id));
        if tx.try_send(BrowserOutbound::Envelope(snapshot)).is_err() {
            inner.browsers.remove(&conn_id);
            return;
        }

        if let Some(after) = last_message_id {
            for entry in inner.buffer.get_after(after) {
                let replayed = entry.envelope.clone().decorated_as_replay(&entry.id);
                if tx.try_send(BrowserOutbound::Envelope(replayed)).is_err() {
                    inner.browsers.remove(&conn_id);
                    return;
                }
            }
        }
        debug!(
            "Browser conn {} subscribed to session {} ({} attached)",
            conn_id,
            self.session_id,
            inner.browsers.len()
        );
    }

    /// Remove a browser socket.
    pub fn detach_browser(&self, conn_id: u64) {
        self.lock().browsers.remove(&conn_id);
    }

    // ========================================================================
    // Pending permissions
    // ========================================================================

    /// Track an outstanding `can_use_tool` request, dropping the oldest past
    /// the cap.
    pub fn add_pending_permission(&self, request_id: &str, request: PermissionRequest) {
        let mut inner = self.lock();
        if !inner.pending_permissions.contains_key(request_id) {
            inner.pending_order.push_back(request_id.to_string());
        }
        inner
            .pending_permissions
            .insert(request_id.to_string(), request);
        while inner.pending_order.len() > MAX_PENDING_PERMISSIONS {
            if let Some(evicted) = inner.pending_order.pop_front() {
                inner.pending_permissions.remove(&evicted);
                warn!(
                    "Dropped oldest pending permission {} for session {}",
                    evicted, self.session_id
                );
            }
        }
    }

    /// Resolve and remove a pending permission request.
    pub fn take_pending_permission(&self, request_id: &str) -> Option<PermissionRequest> {
        let mut inner = self.lock();
        let request = inner.pending_permissions.remove(request_id)?;
        inner.pending_order.retain(|id| id != request_id);
        Some(request)
    }

    pub fn pending_permission_count(&self) -> usize {
        self.lock().pending_permissions.len()
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    /// Buffer an envelope and fan it out to every attached browser.
    ///
    /// The payload gains `sessionId` (if absent) and `_messageID` so clients
    /// can resume from it. Returns the buffer entry ID. Browsers whose queue
    /// is full or closed are dropped here rather than blocking the fan-out.
    pub fn broadcast(&self, kind: EnvelopeKind, payload: Value) -> String {
        let mut inner = self.lock();
        self.broadcast_locked(&mut inner, kind, payload)
    }

    fn broadcast_locked(
        &self,
        inner: &mut RelayInner,
        kind: EnvelopeKind,
        mut payload: Value,
    ) -> String {
        if let Value::Object(map) = &mut payload {
            map.entry("sessionId")
                .or_insert_with(|| Value::String(self.session_id.clone()));
        }
        let envelope = Envelope::new(kind, payload);
        let id = inner.buffer.push(envelope.clone());

        let mut live = envelope;
        if let Value::Object(map) = &mut live.payload {
            map.insert("_messageID".to_string(), Value::String(id.clone()));
        }

        let mut dead = Vec::new();
        for (&conn_id, tx) in inner.browsers.iter() {
            if tx
                .try_send(BrowserOutbound::Envelope(live.clone()))
                .is_err()
            {
                dead.push(conn_id);
            }
        }
        for conn_id in dead {
            warn!(
                "Dropping unresponsive browser conn {} from session {}",
                conn_id, self.session_id
            );
            inner.browsers.remove(&conn_id);
        }
        id
    }

    /// Enter a startup phase and broadcast the matching `session_status`.
    ///
    /// `ready` is consumed: it is broadcast once and the phase is then cleared
    /// to mean "fully active".
    pub fn broadcast_startup_phase(&self, phase: StartupPhase, extras: PhaseExtras) {
        let mut inner = self.lock();
        inner.startup_phase = Some(phase);
        inner.startup_phase_started_at = Utc::now();

        let mut payload = json!({
            "status": phase.derived_status().to_string(),
            "startupPhase": phase,
            "startupTimestamp": inner.startup_phase_started_at.to_rfc3339(),
            "initialized": inner.initialized,
        });
        if let Value::Object(map) = &mut payload {
            if let Some(error) = &extras.error {
                map.insert("error".to_string(), Value::String(error.clone()));
            }
            if let Some(capabilities) = &extras.capabilities {
                map.insert(
                    "capabilities".to_string(),
                    serde_json::to_value(capabilities).unwrap_or(Value::Null),
                );
            }
        }
        self.broadcast_locked(&mut inner, EnvelopeKind::SessionStatus, payload);

        if phase == StartupPhase::Ready {
            inner.startup_phase = None;
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Tear the relay down: stop the keep-alive, close the agent socket with
    /// a normal close, tell browsers the session stopped, and close them with
    /// going-away. Completes without waiting on any peer.
    pub fn shutdown(&self, reason: &str) {
        let mut inner = self.lock();
        if let Some(handle) = inner.keep_alive.take() {
            handle.abort();
        }
        if let Some(agent) = inner.agent.take() {
            let _ = agent.tx.try_send(AgentOutbound::Close {
                code: 1000,
                reason: reason.to_string(),
            });
        }
        self.broadcast_locked(
            &mut inner,
            EnvelopeKind::SessionStatus,
            json!({ "status": "stopped", "reason": reason }),
        );
        for (_, tx) in inner.browsers.drain() {
            let _ = tx.try_send(BrowserOutbound::Close {
                code: 1001,
                reason: reason.to_string(),
            });
        }
        inner.pending_permissions.clear();
        inner.pending_order.clear();
        info!("Relay for session {} shut down: {}", self.session_id, reason);
    }

    /// Current-state payload for a subscribing browser.
    pub fn snapshot(&self) -> Value {
        let inner = self.lock();
        snapshot_payload(&inner, &self.session_id)
    }
}

/// Derive the snapshot status string: pre-ready phases read as `starting`,
/// a failed phase as `errored`, then `active`/`waiting` by agent presence.
fn snapshot_status(inner: &RelayInner) -> &'static str {
    match inner.startup_phase {
        Some(phase) if phase.is_pre_ready() => "starting",
        Some(StartupPhase::Failed) => "errored",
        _ => {
            if inner.agent.is_some() {
                "active"
            } else {
                "waiting"
            }
        }
    }
}

fn snapshot_payload(inner: &RelayInner, session_id: &str) -> Value {
    let pending: Vec<Value> = inner
        .pending_order
        .iter()
        .filter_map(|id| {
            inner.pending_permissions.get(id).map(|req| {
                json!({
                    "requestId": id,
                    "toolName": req.tool_name,
                    "toolUseId": req.tool_use_id,
                    "input": req.input,
                    "reason": req.decision_reason,
                })
            })
        })
        .collect();

    let mut payload = json!({
        "sessionId": session_id,
        "status": snapshot_status(inner),
        "initialized": inner.initialized,
        "capabilities": &inner.capabilities,
        "pendingPermissions": pending,
    });
    if let Some(phase) = inner.startup_phase {
        if let Value::Object(map) = &mut payload {
            map.insert("startupPhase".to_string(), json!(phase));
            map.insert(
                "startupTimestamp".to_string(),
                json!(inner.startup_phase_started_at.to_rfc3339()),
            );
        }
    }
    payload
}

fn spawn_keep_alive(session_id: String, tx: AgentSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS));
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            if tx
                .send(AgentOutbound::Frame(ServerFrame::KeepAlive))
                .await
                .is_err()
            {
                debug!("Keep-alive channel closed for session {}", session_id);
                break;
            }
        }
    })
}
