//! Wire protocol between a device and the relay broker.
//!
//! Frames are bincode-encoded and travel as binary WebSocket messages:
//! ```text
//! device ──► Connect { username, password }          (first frame)
//! device ──► Subscribe { filter } / Unsubscribe { filter }
//! device ──► Publish { topic, payload, retain }
//! device ◄── Deliver { topic, payload }              (fan-out from relay)
//! device ──► Ping            device ◄── Pong         (keepalive)
//! ```
//!
//! Application payloads are opaque bytes at this layer; the transport
//! decodes them as UTF-8 text before anything downstream sees them.

use serde::{Deserialize, Serialize};

/// A single frame on the device ↔ relay link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame after the socket opens. Credentials are opaque to the
    /// relay; it logs and accepts them.
    Connect { username: String, password: String },

    /// Register interest in a topic filter. A trailing `#` segment matches
    /// the remainder of any topic.
    Subscribe { filter: String },

    /// Remove a previously registered filter.
    Unsubscribe { filter: String },

    /// Publish a payload to a topic. `retain` keeps the payload as the
    /// topic's last-known value, replayed to late subscribers.
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },

    /// Relay → device delivery of a published payload.
    Deliver { topic: String, payload: Vec<u8> },

    /// Keepalive probe.
    Ping,

    /// Keepalive answer.
    Pong,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
