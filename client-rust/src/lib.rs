//! beacon client library.
//!
//! One [`ChannelManager`] per process owns the single WebSocket to the
//! gateway. UI code registers listeners once; they keep firing across
//! reconnects, and the manager re-joins the user's notification room and the
//! active workspace on every fresh connection.
//!
//! ```ignore
//! let manager = Arc::new(ChannelManager::new(ClientConfig::from_env()?));
//! manager.on(ServerEvent::Notification, Arc::new(|p: &JsonValue| println!("{p}")));
//! manager.initialize("u1");
//! manager.join_workspace_channel("w1");
//! ```

use std::collections::HashMap;
use std::env;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Frames queued by `emit` while connected. Anything still queued when the
/// connection drops is discarded.
const OUTBOUND_BUFFER: usize = 64;

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway base URL. `http(s)://` is rewritten to `ws(s)://`, `/ws` appended if missing.
    pub endpoint: String,
    /// Session token sent as a cookie on every handshake.
    pub token: Option<String>,
    pub token_cookie: String,
    /// Consecutive failed reconnects before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            token_cookie: "token".into(),
            reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }

    /// Read `BEACON_URL`, `BEACON_TOKEN`, `BEACON_RECONNECT_ATTEMPTS` and
    /// `BEACON_RECONNECT_DELAY_MS`.
    pub fn from_env() -> Result<Self, ClientError> {
        let endpoint = env::var("BEACON_URL")
            .map_err(|_| ClientError::Config("BEACON_URL not set".into()))?;
        let mut config = Self::new(endpoint);
        config.token = env::var("BEACON_TOKEN").ok().filter(|t| !t.is_empty());
        if let Ok(v) = env::var("BEACON_RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = v
                .parse()
                .map_err(|e| ClientError::Config(format!("BEACON_RECONNECT_ATTEMPTS: {e}")))?;
        }
        if let Ok(v) = env::var("BEACON_RECONNECT_DELAY_MS") {
            let ms: u64 = v
                .parse()
                .map_err(|e| ClientError::Config(format!("BEACON_RECONNECT_DELAY_MS: {e}")))?;
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Connection state as seen by UI code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted. `initialize` starts over.
    Offline,
}

impl ConnectionState {
    fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

/// Events the gateway pushes to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    Notification,
    WorkspaceInvitation,
    UrgentNotification,
    ChatMessage,
    UserTyping,
    TestNotification,
    Error,
}

impl ServerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::WorkspaceInvitation => "workspace-invitation",
            Self::UrgentNotification => "urgent-notification",
            Self::ChatMessage => "chat-message",
            Self::UserTyping => "user-typing",
            Self::TestNotification => "test-notification",
            Self::Error => "error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "notification" => Self::Notification,
            "workspace-invitation" => Self::WorkspaceInvitation,
            "urgent-notification" => Self::UrgentNotification,
            "chat-message" => Self::ChatMessage,
            "user-typing" => Self::UserTyping,
            "test-notification" => Self::TestNotification,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Events a client sends to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    JoinNotificationRoom,
    JoinWorkspaceChat,
    LeaveWorkspaceChat,
    TypingChat,
}

impl ClientEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinNotificationRoom => "join-notification-room",
            Self::JoinWorkspaceChat => "join-workspace-chat",
            Self::LeaveWorkspaceChat => "leave-workspace-chat",
            Self::TypingChat => "typing-chat",
        }
    }
}

/// Listener callback. Identity is the `Arc` allocation, so registering the
/// same `Arc` twice is a no-op.
pub type Listener = Arc<dyn Fn(&JsonValue) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════
// Channel manager
// ═══════════════════════════════════════════════════════════════

/// Owns the one physical connection and the listener map.
///
/// Construct once at startup and share by reference (`Arc<ChannelManager>`).
/// All methods are synchronous; network work happens on a background task.
pub struct ChannelManager {
    config: ClientConfig,
    shared: Arc<Shared>,
}

struct Shared {
    listeners: Mutex<HashMap<ServerEvent, Vec<Listener>>>,
    session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
}

#[derive(Default)]
struct Session {
    user_id: Option<String>,
    workspace: Option<String>,
    /// Bumped on every initialize/disconnect. A task whose generation is
    /// stale may not touch state.
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelManager {
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shared: Arc::new(Shared {
                listeners: Mutex::new(HashMap::new()),
                session: Mutex::new(Session::default()),
                state_tx,
            }),
        }
    }

    /// Start the connection for `user_id`. While a connection task is alive
    /// this returns the current state and opens nothing new.
    ///
    /// The connection task runs on the ambient tokio runtime. Called outside
    /// one, nothing is started and the state stays as it was.
    pub fn initialize(&self, user_id: impl Into<String>) -> ConnectionState {
        let mut session = self.shared.session.lock();
        let current = *self.shared.state_tx.borrow();
        if current.is_live() {
            debug!(state = ?current, "already initialized");
            return current;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("initialize called outside a tokio runtime, not connecting");
            return current;
        };

        session.user_id = Some(user_id.into());
        session.generation += 1;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        session.shutdown = Some(shutdown_tx);
        self.shared.state_tx.send_replace(ConnectionState::Connecting);

        let task = runtime.spawn(connection_task(
            Arc::clone(&self.shared),
            self.config.clone(),
            session.generation,
            shutdown_rx,
        ));
        if let Some(old) = session.task.replace(task) {
            old.abort();
        }
        ConnectionState::Connecting
    }

    /// Close the connection and stop reconnecting. Listeners and the active
    /// workspace are kept for a later `initialize`.
    pub fn disconnect(&self) {
        let mut session = self.shared.session.lock();
        session.generation += 1;
        session.outbound = None;
        if let Some(shutdown) = session.shutdown.take() {
            let _ = shutdown.send(());
        }
        session.task = None;
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        info!("disconnected by caller");
    }

    pub fn on(&self, kind: ServerEvent, listener: Listener) {
        let mut listeners = self.shared.listeners.lock();
        let list = listeners.entry(kind).or_default();
        if !list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            list.push(listener);
        }
    }

    pub fn off(&self, kind: ServerEvent, listener: &Listener) {
        if let Some(list) = self.shared.listeners.lock().get_mut(&kind) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Drop every listener for `kind`.
    pub fn off_all(&self, kind: ServerEvent) {
        self.shared.listeners.lock().remove(&kind);
    }

    /// Send an event if connected. `false` means nothing was sent; there is
    /// no queue to retry from.
    pub fn emit(&self, kind: ClientEvent, payload: JsonValue) -> bool {
        let session = self.shared.session.lock();
        self.shared.forward(&session, kind, payload)
    }

    pub fn send_typing(&self, workspace_id: &str, user_name: &str) -> bool {
        self.emit(
            ClientEvent::TypingChat,
            serde_json::json!({ "workspaceId": workspace_id, "userName": user_name }),
        )
    }

    /// Make `workspace_id` the active workspace. It is re-joined after every
    /// reconnect. Returns whether the join went out now.
    pub fn join_workspace_channel(&self, workspace_id: &str) -> bool {
        let mut session = self.shared.session.lock();
        session.workspace = Some(workspace_id.to_owned());
        self.shared
            .forward(&session, ClientEvent::JoinWorkspaceChat, JsonValue::from(workspace_id))
    }

    pub fn leave_workspace_channel(&self, workspace_id: &str) -> bool {
        let mut session = self.shared.session.lock();
        if session.workspace.as_deref() == Some(workspace_id) {
            session.workspace = None;
        }
        self.shared
            .forward(&session, ClientEvent::LeaveWorkspaceChat, JsonValue::from(workspace_id))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state changes, e.g. to show an offline banner.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(task) = self.shared.session.lock().task.take() {
            task.abort();
        }
    }
}

impl Shared {
    fn forward(&self, session: &Session, kind: ClientEvent, payload: JsonValue) -> bool {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return false;
        }
        let Some(tx) = &session.outbound else {
            return false;
        };
        match encode(kind, payload) {
            Ok(frame) => tx.try_send(frame).is_ok(),
            Err(e) => {
                warn!(event = kind.as_str(), "encode failed: {e}");
                false
            }
        }
    }

    /// Set state on behalf of task `generation`. False once the task is stale.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let session = self.session.lock();
        if session.generation != generation {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    /// Publish a fresh connection's queue and snapshot what to re-join.
    fn attach(
        &self,
        generation: u64,
        tx: mpsc::Sender<String>,
    ) -> Option<(Option<String>, Option<String>)> {
        let mut session = self.session.lock();
        if session.generation != generation {
            return None;
        }
        session.outbound = Some(tx);
        self.state_tx.send_replace(ConnectionState::Connected);
        Some((session.user_id.clone(), session.workspace.clone()))
    }

    fn detach(&self, generation: u64) {
        let mut session = self.session.lock();
        if session.generation == generation {
            session.outbound = None;
        }
    }

    /// Route one server frame to its listeners.
    fn dispatch(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                debug!("unparseable server frame: {e}");
                return;
            }
        };
        let Some(kind) = ServerEvent::from_wire(&frame.event) else {
            debug!(event = %frame.event, "no such event kind, ignored");
            return;
        };
        // Snapshot so listeners may call on/off.
        let targets = self
            .listeners
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for listener in targets {
            // A panicking listener must not take the connection task down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&frame.data))).is_err() {
                warn!(event = kind.as_str(), "listener panicked, skipped");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Background connection task
// ═══════════════════════════════════════════════════════════════

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: JsonValue,
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: JsonValue,
}

fn encode(kind: ClientEvent, data: JsonValue) -> Result<String, ClientError> {
    Ok(serde_json::to_string(&OutboundFrame {
        event: kind.as_str(),
        data,
    })?)
}

enum Exit {
    /// Caller asked us to stop.
    Shutdown,
    /// Server close, transport error or stream end.
    Dropped,
}

/// Convert an endpoint to a ws:// URL suitable for tungstenite.
/// Handles: ws://, wss://, http://, https://
fn normalize_ws_url(ep: &str) -> String {
    let url = ep
        .trim_end_matches('/')
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    if url.ends_with("/ws") {
        url
    } else {
        format!("{url}/ws")
    }
}

async fn connect(config: &ClientConfig, url: &str) -> Result<Ws, ClientError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = &config.token {
        let cookie = HeaderValue::from_str(&format!("{}={token}", config.token_cookie))
            .map_err(|e| ClientError::Config(format!("token not usable as cookie: {e}")))?;
        request.headers_mut().insert(COOKIE, cookie);
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// One task per `initialize`. Connects, runs, reconnects with backoff until
/// shut down or out of attempts.
async fn connection_task(
    shared: Arc<Shared>,
    config: ClientConfig,
    generation: u64,
    mut shutdown: oneshot::Receiver<()>,
) {
    let url = normalize_ws_url(&config.endpoint);
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            res = connect(&config, &url) => res,
            _ = &mut shutdown => return,
        };

        match connected {
            Ok(ws) => {
                info!(url = %url, "WebSocket connected");
                attempt = 0;
                match run_connection(&shared, generation, ws, &mut shutdown).await {
                    Exit::Shutdown => return,
                    Exit::Dropped => info!("connection lost"),
                }
            }
            Err(e) => warn!(url = %url, attempt, "WebSocket connect failed: {e}"),
        }

        attempt = attempt.saturating_add(1);
        if attempt > config.reconnect_attempts {
            warn!(attempts = config.reconnect_attempts, "reconnect attempts exhausted, going offline");
            shared.set_state(generation, ConnectionState::Offline);
            return;
        }
        if !shared.set_state(generation, ConnectionState::Reconnecting) {
            return;
        }

        let delay = backoff_delay(attempt, config.reconnect_base_delay, config.reconnect_max_delay);
        debug!(ms = delay.as_millis(), attempt, "backoff sleep");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => return,
        }
    }
}

async fn run_connection(
    shared: &Shared,
    generation: u64,
    ws: Ws,
    shutdown: &mut oneshot::Receiver<()>,
) -> Exit {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    // Attach before replaying so a join issued meanwhile queues behind the replay.
    let Some((user_id, workspace)) = shared.attach(generation, tx) else {
        let _ = sink.send(Message::Close(None)).await;
        return Exit::Shutdown;
    };

    let mut replay = Vec::new();
    if let Some(user_id) = user_id {
        replay.push((ClientEvent::JoinNotificationRoom, JsonValue::from(user_id)));
    }
    if let Some(workspace) = workspace {
        replay.push((ClientEvent::JoinWorkspaceChat, JsonValue::from(workspace)));
    }
    for (kind, data) in replay {
        let sent = match encode(kind, data) {
            Ok(frame) => sink.send(Message::Text(frame)).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            shared.detach(generation);
            return Exit::Dropped;
        }
    }

    let exit = loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                break Exit::Shutdown;
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!("send error: {e}");
                    break Exit::Dropped;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Close(frame))) => {
                    info!(reason = ?frame, "server closed connection");
                    break Exit::Dropped;
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    warn!("ws recv error: {e}");
                    break Exit::Dropped;
                }
                None => {
                    info!("ws stream ended");
                    break Exit::Dropped;
                }
            },
        }
    };

    shared.detach(generation);
    exit
}

/// Exponential backoff with jitter.
/// delay = min(base × 2^(attempt-1), max) + random(0, delay × 0.5)
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let capped = base.saturating_mul(factor).min(max);
    let jitter = capped.mul_f64(rand::random::<f64>() * 0.5);
    capped + jitter
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
