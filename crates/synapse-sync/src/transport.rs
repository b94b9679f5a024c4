//! # WebSocket Transport
//!
//! WebSocket client for the hub with automatic reconnection and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │                    │               │                           │
//! │        │              disconnect/error      │  timer expired            │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  State changes are published on a watch channel; the socket layer      │
//! │  registers on every transition into Connected.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::SynapseMessage;

/// Capacity of the outgoing and incoming message queues.
const CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Transport State
// =============================================================================

/// Connection state for the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Hub Connection Trait
// =============================================================================

/// What the socket layer needs from a connection to the hub.
///
/// `send` only enqueues; delivery happens on the transport task.
pub trait HubConnection: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn send(&self, message: SynapseMessage) -> SyncResult<()>;

    /// Receiver for the latest state. Intermediate states can be missed.
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Number of connections established so far. Bumped before each
    /// transition into `Connected`, so a reconnect is visible even when
    /// the states in between were never observed.
    fn connection_epoch(&self) -> u64;
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Bearer token for the handshake.
    pub token: Option<String>,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Maximum reconnection attempts (0 = infinite).
    pub max_retries: u32,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: String::new(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0, // Infinite
            ping_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for interacting with the transport from other components.
#[derive(Clone)]
pub struct TransportHandle {
    /// Sender for outgoing messages.
    outgoing_tx: mpsc::Sender<SynapseMessage>,

    /// Current connection state.
    state: Arc<watch::Sender<ConnectionState>>,

    /// Shutdown signal.
    shutdown_tx: Arc<watch::Sender<bool>>,

    /// Connections established so far.
    epoch: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Returns true if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Triggers graceful shutdown. The socket is closed with a close frame.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl HubConnection for TransportHandle {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn send(&self, message: SynapseMessage) -> SyncResult<()> {
        self.outgoing_tx
            .try_send(message)
            .map_err(|e| SyncError::ChannelError(format!("Failed to queue message: {}", e)))
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let config = TransportConfig {
///     url: "ws://homeassistant.local:8123/api/synapse".into(),
///     ..Default::default()
/// };
///
/// let (handle, mut incoming_rx) = Transport::spawn(config);
/// handle.send(SynapseMessage::heartbeat(hash))?;
///
/// while let Some(msg) = incoming_rx.recv().await {
///     println!("Received: {}", msg.type_name());
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    epoch: Arc<AtomicU64>,
    outgoing_rx: mpsc::Receiver<SynapseMessage>,
    incoming_tx: mpsc::Sender<SynapseMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Why a connection loop ended.
enum LoopExit {
    Closed,
    Shutdown,
}

impl Transport {
    /// Creates a new transport and spawns its background task.
    ///
    /// Returns a handle for sending messages and a receiver for incoming messages.
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<SynapseMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<SynapseMessage>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<SynapseMessage>(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);
        let epoch = Arc::new(AtomicU64::new(0));

        let transport = Transport {
            config,
            state: state.clone(),
            epoch: epoch.clone(),
            outgoing_rx,
            incoming_tx,
            shutdown_rx,
        };

        tokio::spawn(transport.run());

        let handle = TransportHandle {
            outgoing_tx,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            epoch,
        };

        (handle, incoming_rx)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Main transport loop.
    async fn run(mut self) {
        info!(url = %self.config.url, "Transport starting");

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;

        loop {
            if self.shutdown_requested() {
                info!("Transport received shutdown signal");
                break;
            }

            self.set_state(ConnectionState::Connecting);

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("WebSocket connected");
                    // Anything queued while offline was built against stale state.
                    let mut stale = 0usize;
                    while self.outgoing_rx.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        debug!(stale, "Dropped messages queued while disconnected");
                    }

                    let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(epoch, "Connection epoch advanced");
                    self.set_state(ConnectionState::Connected);
                    backoff.reset();
                    retry_count = 0;

                    match self.connection_loop(ws_stream).await {
                        Ok(LoopExit::Shutdown) => break,
                        Ok(LoopExit::Closed) => info!("Connection closed by hub"),
                        Err(e) => warn!(error = %e, "Connection loop ended"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect");
                }
            }

            self.set_state(ConnectionState::Backoff);

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            if let Some(duration) = backoff.next_backoff() {
                debug!(?duration, attempt = retry_count, "Waiting before reconnect");

                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        self.set_state(ConnectionState::Reconnecting);
                    }
                    _ = self.shutdown_rx.changed() => {
                        info!("Shutdown during backoff");
                        break;
                    }
                }
            } else {
                error!("Backoff exhausted");
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Transport stopped");
    }

    /// Connects with timeout, attaching the bearer token when configured.
    async fn connect_with_timeout(
        &self,
    ) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SyncError::InvalidConfig(format!("Invalid hub token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        match timeout(self.config.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    /// Main connection loop - handles sending and receiving.
    async fn connection_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SyncResult<LoopExit> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.outgoing_rx.recv() => {
                    let json = msg.to_json()?;
                    debug!(msg_type = %msg.type_name(), "Sending message");
                    write.send(WsMessage::Text(json.into())).await?;
                }

                incoming = read.next() => {
                    let Some(result) = incoming else {
                        return Ok(LoopExit::Closed);
                    };
                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match SynapseMessage::from_json(&text) {
                                Ok(msg) => {
                                    debug!(msg_type = %msg.type_name(), "Received message");
                                    if self.incoming_tx.send(msg).await.is_err() {
                                        warn!("Incoming message receiver dropped");
                                        return Err(SyncError::ChannelError("Receiver dropped".into()));
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Failed to parse message");
                                }
                            }
                        }
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Received close frame");
                            return Ok(LoopExit::Closed);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Received unexpected binary message");
                        }
                        Ok(WsMessage::Frame(_)) => {}
                        Err(e) => {
                            error!(error = %e, "WebSocket error");
                            return Err(SyncError::from(e));
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(Vec::new().into())).await?;
                }

                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, closing connection");
                    // Flush whatever was queued before shutdown (going_offline).
                    while let Ok(msg) = self.outgoing_rx.try_recv() {
                        let json = msg.to_json()?;
                        let _ = write.send(WsMessage::Text(json.into())).await;
                    }
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(LoopExit::Shutdown);
                }
            }
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 0);
        assert!(config.token.is_none());
    }

    #[tokio::test]
    async fn test_handle_starts_disconnected_and_stops() {
        let (handle, _incoming) = Transport::spawn(TransportConfig {
            url: "ws://127.0.0.1:1/api/synapse".into(),
            connect_timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(10),
            max_retries: 1,
            ..Default::default()
        });

        assert!(!handle.is_connected());
        let mut state = handle.subscribe_state();
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != ConnectionState::Disconnected {
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}
