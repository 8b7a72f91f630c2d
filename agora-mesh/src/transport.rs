//! One WebSocket link to the relay broker.
//!
//! Connection lifecycle:
//! ```text
//! connect()
//!    │
//!    ▼
//! Connecting ──dial ok──► Connected ──link lost──► Disconnected
//!    │                                                  │
//!    └──dial failed──► Offline ◄──redial failed─────────┤
//!                         │                             │
//!                         └────────redial ok────────► Reconnected
//! ```
//!
//! The link is supervised by a spawned task: it dials, runs one session
//! (reader/writer/keepalive in a single `select!` loop), and re-dials with
//! capped exponential backoff when the session ends without an explicit
//! `disconnect`. State transitions are surfaced through a callback and are
//! advisory only — nothing is queued while the link is down; publishes and
//! subscriptions issued then are silently dropped and must be re-issued
//! after the next Connected/Reconnected transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::Frame;

/// Buffered outbound frames per connection. Publishes beyond this while the
/// writer is backlogged are dropped (at-most-once from the caller's view).
const OUTBOUND_CAPACITY: usize = 256;

const RECONNECT_MIN_MS: u64 = 500;
const RECONNECT_MAX_MS: u64 = 30_000;

/// Link state. `Connecting` is observable via [`BrokerLink::state`] but the
/// state callback only fires for the other four transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnected,
    Offline,
}

/// Where and how to reach the relay broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Host name or IP, optionally with a `ws://`/`wss://` scheme.
    pub address: String,
    pub port: u16,
    /// Opaque credentials, announced in the first frame.
    pub username: String,
    pub password: String,
    /// Seconds between keepalive pings.
    pub keepalive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9001,
            username: String::new(),
            password: String::new(),
            keepalive_secs: 30,
        }
    }
}

impl BrokerConfig {
    /// WebSocket URL for this config.
    pub fn url(&self) -> String {
        if self.address.contains("://") {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("ws://{}:{}", self.address, self.port)
        }
    }
}

/// Fired on Connected / Disconnected / Reconnected / Offline.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Fired with (topic, message) for every UTF-8-decodable delivery.
pub type DeliveryCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// One live dial: outbound queue plus the flag that stops its supervisor.
/// Torn down and replaced wholesale on reconfiguration, never mutated.
struct Connection {
    config: BrokerConfig,
    outgoing: mpsc::Sender<Frame>,
    shutdown: Arc<AtomicBool>,
}

/// One logical link to a relay broker.
///
/// Owns the connection exclusively; all traffic in and out of the process
/// flows through it. Callbacks are installed per `connect` and dropped on
/// teardown, so a replaced connection can never fire stale notifications.
pub struct BrokerLink {
    state: Arc<RwLock<ConnectionState>>,
    conn: RwLock<Option<Connection>>,
}

impl Default for BrokerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            conn: RwLock::new(None),
        }
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_up(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnected
        )
    }

    /// Establish (or re-establish) the link.
    ///
    /// A call with the current config while the link is live is a no-op.
    /// Any other live connection is torn down first — its callbacks are
    /// dropped and the state resets to Disconnected — before the new dial
    /// starts. Establishment is asynchronous: the call returns immediately
    /// and completion is observed only through `on_state`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        &self,
        config: BrokerConfig,
        on_state: StateCallback,
        on_delivery: DeliveryCallback,
    ) {
        let mut slot = self.conn.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            let live = matches!(
                self.state(),
                ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Reconnected
            );
            if live && existing.config == config {
                return;
            }
        }

        if let Some(prev) = slot.take() {
            prev.shutdown.store(true, Ordering::SeqCst);
            *self.state.write().unwrap_or_else(PoisonError::into_inner) =
                ConnectionState::Disconnected;
        }

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Connecting;

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        *slot = Some(Connection {
            config: config.clone(),
            outgoing: out_tx,
            shutdown: shutdown.clone(),
        });
        drop(slot);

        let state = self.state.clone();
        tokio::spawn(supervise(
            config,
            out_rx,
            shutdown,
            state,
            on_state,
            on_delivery,
        ));
    }

    /// Fire-and-forget publish. Dropped silently when the link is down or
    /// the outbound queue is full.
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) {
        if !self.is_up() {
            log::trace!("publish to {topic} dropped: link down");
            return;
        }
        self.send_frame(Frame::Publish {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain,
        });
    }

    /// Register a topic filter at the relay. No effect while disconnected.
    pub fn subscribe(&self, filter: &str) {
        if !self.is_up() {
            return;
        }
        log::debug!("subscribing {filter}");
        self.send_frame(Frame::Subscribe {
            filter: filter.to_string(),
        });
    }

    /// Remove a topic filter at the relay. No effect while disconnected.
    pub fn unsubscribe(&self, filter: &str) {
        if !self.is_up() {
            return;
        }
        self.send_frame(Frame::Unsubscribe {
            filter: filter.to_string(),
        });
    }

    fn send_frame(&self, frame: Frame) {
        let slot = self.conn.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = slot.as_ref() {
            if conn.outgoing.try_send(frame).is_err() {
                log::trace!("outbound frame dropped: queue full or closing");
            }
        }
    }

    /// Tear the link down. Both callbacks are dropped with the connection
    /// and the state resets to Disconnected. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let prev = self
            .conn
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = prev {
            conn.shutdown.store(true, Ordering::SeqCst);
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            ConnectionState::Disconnected;
    }
}

/// Record a transition and notify, unless the connection was torn down.
fn transition(
    state: &RwLock<ConnectionState>,
    shutdown: &AtomicBool,
    on_state: &StateCallback,
    next: ConnectionState,
) {
    if shutdown.load(Ordering::SeqCst) {
        return;
    }
    *state.write().unwrap_or_else(PoisonError::into_inner) = next;
    on_state(next);
}

/// Dial loop: one session per successful dial, capped exponential backoff
/// between attempts, until shutdown.
async fn supervise(
    config: BrokerConfig,
    mut out_rx: mpsc::Receiver<Frame>,
    shutdown: Arc<AtomicBool>,
    state: Arc<RwLock<ConnectionState>>,
    on_state: StateCallback,
    on_delivery: DeliveryCallback,
) {
    let mut dialed_once = false;
    let mut backoff = Duration::from_millis(RECONNECT_MIN_MS);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        match tokio_tungstenite::connect_async(config.url()).await {
            Ok((ws, _)) => {
                backoff = Duration::from_millis(RECONNECT_MIN_MS);
                let entered = if dialed_once {
                    ConnectionState::Reconnected
                } else {
                    ConnectionState::Connected
                };
                dialed_once = true;
                transition(&state, &shutdown, &on_state, entered);

                let lost = run_session(&config, ws, &mut out_rx, &shutdown, &on_delivery).await;
                if !lost {
                    // Explicit teardown: exit without a transition (the
                    // link already reset its state).
                    return;
                }
                log::info!("link to {} lost", config.url());
                transition(&state, &shutdown, &on_state, ConnectionState::Disconnected);
            }
            Err(e) => {
                log::debug!("dial {} failed: {e}", config.url());
                transition(&state, &shutdown, &on_state, ConnectionState::Offline);
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(RECONNECT_MAX_MS));
    }
}

/// Run one session over an established socket.
///
/// Returns `true` when the link was lost and should be re-dialed, `false`
/// on explicit teardown.
async fn run_session(
    config: &BrokerConfig,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    out_rx: &mut mpsc::Receiver<Frame>,
    shutdown: &AtomicBool,
    on_delivery: &DeliveryCallback,
) -> bool {
    let (mut writer, mut reader) = ws.split();

    // Announce credentials before anything else goes out.
    let hello = Frame::Connect {
        username: config.username.clone(),
        password: config.password.clone(),
    };
    match hello.encode() {
        Ok(bytes) => {
            if writer.send(Message::Binary(bytes.into())).await.is_err() {
                return !shutdown.load(Ordering::SeqCst);
            }
        }
        Err(e) => {
            log::warn!("failed to encode connect frame: {e}");
            return !shutdown.load(Ordering::SeqCst);
        }
    }

    let mut keepalive =
        tokio::time::interval(Duration::from_secs(config.keepalive_secs.max(1)));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let bytes = match frame.encode() {
                            Ok(b) => b,
                            Err(e) => {
                                log::warn!("failed to encode outbound frame: {e}");
                                continue;
                            }
                        };
                        if writer.send(Message::Binary(bytes.into())).await.is_err() {
                            return !shutdown.load(Ordering::SeqCst);
                        }
                    }
                    None => {
                        // Torn down: the outbound queue was dropped.
                        let _ = writer.send(Message::Close(None)).await;
                        return false;
                    }
                }
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match Frame::decode(&bytes) {
                            Ok(Frame::Deliver { topic, payload }) => {
                                match String::from_utf8(payload) {
                                    Ok(text) => on_delivery(&topic, &text),
                                    Err(_) => {
                                        log::warn!("dropping non-UTF-8 payload on {topic}");
                                    }
                                }
                            }
                            Ok(Frame::Pong) => {}
                            Ok(other) => {
                                log::trace!("ignoring unexpected frame: {other:?}");
                            }
                            Err(e) => {
                                log::warn!("dropping undecodable frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if writer.send(Message::Pong(data)).await.is_err() {
                            return !shutdown.load(Ordering::SeqCst);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return !shutdown.load(Ordering::SeqCst);
                    }
                    Some(Err(e)) => {
                        log::warn!("websocket error: {e}");
                        return !shutdown.load(Ordering::SeqCst);
                    }
                    _ => {}
                }
            }

            _ = keepalive.tick() => {
                if let Ok(bytes) = Frame::Ping.encode() {
                    if writer.send(Message::Binary(bytes.into())).await.is_err() {
                        return !shutdown.load(Ordering::SeqCst);
                    }
                }
            }
        }
    }
}
