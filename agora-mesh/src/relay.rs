//! Relay broker: topic-filtered fan-out between WebSocket peers.
//!
//! Architecture:
//! ```text
//! Device A ──┐                        ┌── filters {"room/#"}
//!             ├── RelayServer ── Peer ┤
//! Device B ──┘        │               └── outbound queue
//!                     │
//!                     ├── retained topic → last payload
//!                     └── stats
//! ```
//!
//! Every `Publish` fans out to each peer holding a matching filter — the
//! publisher included, when it subscribed to the topic itself; devices rely
//! on that echo to apply their own state patches. A `retain`ed payload is
//! stored as the topic's last-known value and replayed to late
//! subscribers; an empty retained payload clears the slot.
//!
//! Filters match on `/`-segments with a trailing `#` matching the topic's
//! remainder — including the empty remainder, so `room/#` sees `room`.
//! Slow peers drop frames rather than stalling the relay.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Frame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Outbound frames buffered per peer before drops begin.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9001".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_publishes: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
    pub retained_topics: usize,
}

/// True when `filter` covers `topic`. A final `#` segment matches any
/// remainder, including none: `a/#` covers both `a` and `a/b/c`.
fn subscription_matches(filter: &str, topic: &str) -> bool {
    let mut topic_segs = topic.split('/');
    for filter_seg in filter.split('/') {
        if filter_seg == "#" {
            return true;
        }
        match topic_segs.next() {
            Some(seg) if seg == filter_seg => {}
            _ => return false,
        }
    }
    topic_segs.next().is_none()
}

/// One connected device: its outbound queue and registered filters.
struct Peer {
    sender: mpsc::Sender<Frame>,
    filters: HashSet<String>,
}

/// The relay broker.
pub struct RelayServer {
    config: RelayConfig,
    peers: Arc<RwLock<HashMap<u64, Peer>>>,
    retained: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    stats: Arc<RwLock<RelayStats>>,
    next_peer_id: AtomicU64,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            retained: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_peer_id: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Relay statistics snapshot.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.retained_topics = self.retained.read().await.len();
        stats
    }

    /// Accept loop. Runs until the listener fails; call from a task.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let peer_id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
            let peers = self.peers.clone();
            let retained = self.retained.clone();
            let stats = self.stats.clone();
            let capacity = self.config.channel_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, peer_id, peers, retained, stats, capacity)
                        .await
                {
                    log::warn!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    peer_id: u64,
    peers: Arc<RwLock<HashMap<u64, Peer>>>,
    retained: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    stats: Arc<RwLock<RelayStats>>,
    capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut writer, mut reader) = ws.split();
    log::debug!("peer {peer_id} connected from {addr}");

    let (tx, mut rx) = mpsc::channel(capacity);
    peers.write().await.insert(
        peer_id,
        Peer {
            sender: tx,
            filters: HashSet::new(),
        },
    );
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    loop {
        tokio::select! {
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match Frame::decode(&bytes) {
                            Ok(frame) => {
                                handle_frame(peer_id, frame, &peers, &retained, &stats).await;
                            }
                            Err(e) => {
                                log::warn!("undecodable frame from peer {peer_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        writer.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("websocket error from peer {peer_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        let bytes = frame.encode()?;
                        writer.send(Message::Binary(bytes.into())).await?;
                    }
                    None => break,
                }
            }
        }
    }

    peers.write().await.remove(&peer_id);
    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
    }
    log::debug!("peer {peer_id} disconnected");
    Ok(())
}

async fn handle_frame(
    peer_id: u64,
    frame: Frame,
    peers: &Arc<RwLock<HashMap<u64, Peer>>>,
    retained: &Arc<RwLock<HashMap<String, Vec<u8>>>>,
    stats: &Arc<RwLock<RelayStats>>,
) {
    match frame {
        Frame::Connect { username, .. } => {
            // Credentials are opaque; peers are taken at their word.
            log::info!("peer {peer_id} identified as {username:?}");
        }

        Frame::Subscribe { filter } => {
            let mut peers_w = peers.write().await;
            if let Some(peer) = peers_w.get_mut(&peer_id) {
                peer.filters.insert(filter.clone());

                // Late joiner: replay retained payloads the filter covers.
                let retained_r = retained.read().await;
                for (topic, payload) in retained_r.iter() {
                    if subscription_matches(&filter, topic) {
                        let _ = peer.sender.try_send(Frame::Deliver {
                            topic: topic.clone(),
                            payload: payload.clone(),
                        });
                    }
                }
            }
        }

        Frame::Unsubscribe { filter } => {
            if let Some(peer) = peers.write().await.get_mut(&peer_id) {
                peer.filters.remove(&filter);
            }
        }

        Frame::Publish {
            topic,
            payload,
            retain,
        } => {
            if retain {
                let mut retained_w = retained.write().await;
                if payload.is_empty() {
                    retained_w.remove(&topic);
                } else {
                    retained_w.insert(topic.clone(), payload.clone());
                }
            }

            let (delivered, dropped) = {
                let peers_r = peers.read().await;
                let mut delivered = 0u64;
                let mut dropped = 0u64;
                for peer in peers_r.values() {
                    if peer
                        .filters
                        .iter()
                        .any(|filter| subscription_matches(filter, &topic))
                    {
                        let frame = Frame::Deliver {
                            topic: topic.clone(),
                            payload: payload.clone(),
                        };
                        match peer.sender.try_send(frame) {
                            Ok(()) => delivered += 1,
                            Err(_) => dropped += 1,
                        }
                    }
                }
                (delivered, dropped)
            };
            if dropped > 0 {
                log::warn!("{dropped} deliveries of {topic} dropped (slow peers)");
            }

            let mut s = stats.write().await;
            s.total_publishes += 1;
            s.deliveries += delivered;
            s.dropped_deliveries += dropped;
        }

        Frame::Ping => {
            if let Some(peer) = peers.read().await.get(&peer_id) {
                let _ = peer.sender.try_send(Frame::Pong);
            }
        }

        Frame::Deliver { .. } | Frame::Pong => {
            log::trace!("ignoring relay-bound frame from peer {peer_id}");
        }
    }
}
