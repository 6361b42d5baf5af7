//! Persistent push-event stream.
//!
//! Provides:
//! - Duplex websocket connection to the server's event endpoint, authenticated like the dispatcher
//! - Heartbeat pings on a fixed interval
//! - Typed event channels plus a bounded recent-activity feed
//! - Automatic reconnection with exponential backoff and a fixed attempt budget
//!
//! A supervisor task owns the socket. All state changes go through it or through the
//! client's own entry points, and every transition is published on the state channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::StreamConfig;
use crate::error::{CredentialError, Result, TalonError};
use crate::models::{
    ActivityRecord, AuthMethod, ClientPresence, DecodedEvent, EventEnvelope, FlowCompleted,
    FlowProgress, HuntCompleted, HuntProgress, Notification, ServerEvent, StreamError, StreamState,
};
use crate::services::credentials::CredentialStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derive the websocket URL from the HTTP base URL.
pub fn event_url(server_url: &str, event_path: &str) -> Result<Url> {
    let invalid = || CredentialError::InvalidServerUrl { url: server_url.to_string() };
    let mut url = Url::parse(server_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid().into()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;

    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}{event_path}"));
    Ok(url)
}

/// Broadcast senders for each event kind.
struct EventChannels {
    hunt_progress: broadcast::Sender<HuntProgress>,
    hunt_completed: broadcast::Sender<HuntCompleted>,
    client_connected: broadcast::Sender<ClientPresence>,
    client_disconnected: broadcast::Sender<ClientPresence>,
    flow_progress: broadcast::Sender<FlowProgress>,
    flow_completed: broadcast::Sender<FlowCompleted>,
    notification: broadcast::Sender<Notification>,
    error: broadcast::Sender<StreamError>,
    all: broadcast::Sender<ServerEvent>,
}

impl EventChannels {
    fn new(capacity: usize) -> Self {
        Self {
            hunt_progress: broadcast::channel(capacity).0,
            hunt_completed: broadcast::channel(capacity).0,
            client_connected: broadcast::channel(capacity).0,
            client_disconnected: broadcast::channel(capacity).0,
            flow_progress: broadcast::channel(capacity).0,
            flow_completed: broadcast::channel(capacity).0,
            notification: broadcast::channel(capacity).0,
            error: broadcast::channel(capacity).0,
            all: broadcast::channel(capacity).0,
        }
    }

    // Send errors only mean nobody is subscribed.
    fn publish(&self, event: &ServerEvent) {
        let _ = match event {
            ServerEvent::HuntProgress(e) => self.hunt_progress.send(e.clone()).is_ok(),
            ServerEvent::HuntCompleted(e) => self.hunt_completed.send(e.clone()).is_ok(),
            ServerEvent::ClientConnected(e) => self.client_connected.send(e.clone()).is_ok(),
            ServerEvent::ClientDisconnected(e) => {
                self.client_disconnected.send(e.clone()).is_ok()
            }
            ServerEvent::FlowProgress(e) => self.flow_progress.send(e.clone()).is_ok(),
            ServerEvent::FlowCompleted(e) => self.flow_completed.send(e.clone()).is_ok(),
            ServerEvent::Notification(e) => self.notification.send(e.clone()).is_ok(),
            ServerEvent::Error(e) => self.error.send(e.clone()).is_ok(),
        };
        let _ = self.all.send(event.clone());
    }
}

/// State shared between the client handle and its supervisor task.
struct Shared {
    state: Mutex<StreamState>,
    state_tx: broadcast::Sender<StreamState>,
    channels: EventChannels,
    recent: Mutex<VecDeque<ActivityRecord>>,
    recent_capacity: usize,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Shared {
    fn set_state(&self, next: StreamState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        tracing::debug!(from = ?*state, to = ?next, "Event stream state change");
        *state = next.clone();
        // Publish under the lock so subscribers see transitions in order
        let _ = self.state_tx.send(next);
    }

    fn record(&self, event: &ServerEvent, envelope: &EventEnvelope) {
        let mut recent = self.recent.lock();
        recent.push_front(ActivityRecord::from_event(event, envelope.timestamp));
        recent.truncate(self.recent_capacity);
    }

    fn handle_text(&self, text: &str) {
        let envelope: EventEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable event frame");
                return;
            }
        };

        match ServerEvent::decode(&envelope) {
            DecodedEvent::Known(event) => {
                tracing::trace!(kind = event.kind(), "Event received");
                self.record(&event, &envelope);
                self.channels.publish(&event);
            }
            DecodedEvent::Unknown(kind) => {
                tracing::debug!(kind = %kind, "Dropping event of unknown type");
            }
            DecodedEvent::Malformed { kind, error } => {
                tracing::warn!(kind = %kind, error = %error, "Dropping event with malformed payload");
            }
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    Cancelled,
    Lost(String),
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Client for the server's push-event stream.
pub struct EventStreamClient {
    credentials: Arc<CredentialStore>,
    config: StreamConfig,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl EventStreamClient {
    /// Create a disconnected client.
    pub fn new(credentials: Arc<CredentialStore>, config: StreamConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState::Disconnected),
            state_tx: broadcast::channel(capacity).0,
            channels: EventChannels::new(capacity),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_activity_capacity)),
            recent_capacity: config.recent_activity_capacity.max(1),
            outbound: Mutex::new(None),
        });
        Self { credentials, config, shared, supervisor: Mutex::new(None) }
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.shared.state.lock().clone()
    }

    /// Recent activity, newest first.
    pub fn recent_activity(&self) -> Vec<ActivityRecord> {
        self.shared.recent.lock().iter().cloned().collect()
    }

    /// Open the stream using the active credentials.
    ///
    /// On success the stream is `Connected` and a supervisor keeps it alive. A failed
    /// initial handshake leaves the stream `Failed` and returns the error.
    pub async fn connect(&self) -> Result<()> {
        self.stop_supervisor().await;
        self.shared.set_state(StreamState::Connecting);

        let params = ConnectParams {
            credentials: Arc::clone(&self.credentials),
            event_path: self.config.event_path.clone(),
        };

        let ws = match params.open().await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(error = %e, "Event stream connection failed");
                self.shared.set_state(StreamState::Failed { reason: e.to_string() });
                return Err(e);
            }
        };

        self.shared.set_state(StreamState::Connected);
        tracing::info!(path = %self.config.event_path, "Event stream connected");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            params,
            self.config.clone(),
            ws,
            cancel.clone(),
        ));
        *self.supervisor.lock() = Some(Supervisor { cancel, task });
        Ok(())
    }

    /// Close the stream and stop reconnecting.
    pub async fn disconnect(&self) {
        self.stop_supervisor().await;
        self.shared.set_state(StreamState::Disconnected);
        tracing::info!("Event stream disconnected");
    }

    /// Reset the attempt counter and run the full connect sequence again.
    pub async fn reconnect(&self) -> Result<()> {
        tracing::info!(state = ?self.state(), "Explicit event stream reconnect");
        self.connect().await
    }

    /// Send a JSON text frame. Never queued: fails with `NotConnected` unless connected.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        if !self.state().is_connected() {
            return Err(TalonError::NotConnected);
        }
        let text = serde_json::to_string(message)
            .map_err(|e| TalonError::internal(format!("Failed to encode frame: {e}")))?;

        let sender = self.shared.outbound.lock().clone().ok_or(TalonError::NotConnected)?;
        sender.send(Message::Text(text)).map_err(|_| TalonError::NotConnected)
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(Supervisor { cancel, task }) = supervisor {
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Event stream supervisor panicked");
            }
        }
    }

    // ========== Subscriptions ==========

    /// State transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StreamState> {
        self.shared.state_tx.subscribe()
    }

    /// Every decoded event, in arrival order.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.channels.all.subscribe()
    }

    /// Hunt progress updates.
    pub fn subscribe_hunt_progress(&self) -> broadcast::Receiver<HuntProgress> {
        self.shared.channels.hunt_progress.subscribe()
    }

    /// Hunts that finished.
    pub fn subscribe_hunt_completed(&self) -> broadcast::Receiver<HuntCompleted> {
        self.shared.channels.hunt_completed.subscribe()
    }

    /// Clients coming online.
    pub fn subscribe_client_connected(&self) -> broadcast::Receiver<ClientPresence> {
        self.shared.channels.client_connected.subscribe()
    }

    /// Clients going offline.
    pub fn subscribe_client_disconnected(&self) -> broadcast::Receiver<ClientPresence> {
        self.shared.channels.client_disconnected.subscribe()
    }

    /// Flow progress updates.
    pub fn subscribe_flow_progress(&self) -> broadcast::Receiver<FlowProgress> {
        self.shared.channels.flow_progress.subscribe()
    }

    /// Flows that finished.
    pub fn subscribe_flow_completed(&self) -> broadcast::Receiver<FlowCompleted> {
        self.shared.channels.flow_completed.subscribe()
    }

    /// Server notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.channels.notification.subscribe()
    }

    /// Errors reported by the server over the stream.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<StreamError> {
        self.shared.channels.error.subscribe()
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for EventStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("state", &self.state())
            .field("event_path", &self.config.event_path)
            .finish()
    }
}

/// Everything needed to (re)open the socket.
struct ConnectParams {
    credentials: Arc<CredentialStore>,
    event_path: String,
}

impl ConnectParams {
    async fn open(&self) -> Result<WsStream> {
        let credentials = self.credentials.require_credentials()?;
        let url = event_url(&credentials.server_url, &self.event_path)?;

        let mut request = url.as_str().into_client_request()?;
        if let Some(header) = credentials.method.authorization_header() {
            let value = HeaderValue::from_str(&header)
                .map_err(|_| TalonError::internal("Authorization header is not valid ASCII"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connector = match credentials.method {
            AuthMethod::MutualTls { .. } => {
                let identity = self.credentials.materialize_identity()?;
                Some(Connector::NativeTls(identity.tls_connector()?))
            }
            _ => None,
        };

        tracing::debug!(%url, method = credentials.method.kind(), "Opening event stream");
        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await?;
        Ok(ws)
    }
}

/// Owns the socket across reconnects until cancelled or the attempt budget runs out.
async fn supervise(
    shared: Arc<Shared>,
    params: ConnectParams,
    config: StreamConfig,
    ws: WsStream,
    cancel: CancellationToken,
) {
    let max_attempts = config.max_reconnect_attempts.max(1);
    let mut ws = ws;

    loop {
        let reason = match run_session(&shared, ws, config.heartbeat_interval(), &cancel).await {
            SessionEnd::Cancelled => return,
            SessionEnd::Lost(reason) => reason,
        };
        tracing::warn!(reason = %reason, "Event stream lost");

        let mut last_error = reason;
        let mut attempt = 1;
        ws = loop {
            if attempt > max_attempts {
                tracing::error!(attempts = max_attempts, reason = %last_error, "Event stream reconnect failed");
                shared.set_state(StreamState::Failed { reason: last_error });
                return;
            }

            shared.set_state(StreamState::Reconnecting { attempt });
            let delay = reconnect_delay(config.reconnect_base(), attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = select! {
                biased;
                _ = cancel.cancelled() => return,
                r = params.open() => r,
            };

            match opened {
                Ok(ws) => {
                    shared.set_state(StreamState::Connected);
                    tracing::info!(attempt, "Event stream reconnected");
                    break ws;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                    attempt += 1;
                }
            }
        };
    }
}

/// Delay before reconnect `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift)
}

/// Receive, heartbeat and outbound writes for one open socket.
async fn run_session(
    shared: &Shared,
    ws: WsStream,
    heartbeat: Duration,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    *shared.outbound.lock() = Some(tx);

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    let end = loop {
        select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break SessionEnd::Cancelled;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared.handle_text(text),
                    Err(_) => tracing::debug!(len = bytes.len(), "Ignoring binary frame"),
                },
                Some(Ok(Message::Pong(_))) => tracing::trace!("Heartbeat pong"),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    break SessionEnd::Lost(format!("closed by server: {frame:?}"));
                }
                Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                None => break SessionEnd::Lost("stream ended".to_string()),
            },
            _ = ticker.tick() => {
                tracing::trace!("Heartbeat ping");
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break SessionEnd::Lost(format!("heartbeat failed: {e}"));
                }
            }
            Some(message) = rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    break SessionEnd::Lost(format!("send failed: {e}"));
                }
            }
        }
    };

    *shared.outbound.lock() = None;
    end
}
