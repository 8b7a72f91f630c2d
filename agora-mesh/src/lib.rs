//! # agora-mesh — shared state and RPC for device meshes
//!
//! Lets independent devices collaborate over an unreliable, relay-mediated
//! publish/subscribe transport: a replicated, hierarchically-addressable
//! JSON document shared by all participants, and remote procedure calls
//! with correlated asynchronous results. Late joiners, dropped messages,
//! and silent peers are all survivable.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   WebSocket    ┌─────────────┐   WebSocket   ┌────────────┐
//! │  Device A  │ ◄────────────► │ RelayServer │ ◄───────────► │  Device B  │
//! └─────┬──────┘  bincode Frame └─────────────┘               └─────┬──────┘
//!       │                                                           │
//! ┌─────▼──────┐            per device                        ┌─────▼──────┐
//! │ BrokerLink │  connection, keepalive, reconnect            │ BrokerLink │
//! └─────┬──────┘                                              └─────┬──────┘
//! ┌─────▼──────┐  segment-prefix fan-out                      ┌─────▼──────┐
//! │ TopicRouter│                                              │ TopicRouter│
//! └─┬────────┬─┘                                              └─┬────────┬─┘
//! ┌─▼──────┐ ┌▼──────────┐                              ┌───────▼┐ ┌─────▼─────┐
//! │StateSync│ │RpcEndpoint│                             │StateSync│ │RpcEndpoint│
//! └────────┘ └───────────┘                              └────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — bincode wire frames on the device ↔ relay link
//! - [`transport`] — one supervised WebSocket link per device
//! - [`router`] — sole fan-out point from the link to everything above it
//! - [`state`] — replicated JSON document, path-addressed patches
//! - [`rpc`] — exposed functions, pending calls, call/return correlation
//! - [`relay`] — the broker the devices meet at
//!
//! ## Delivery model
//!
//! Publishes are at-most-once from the caller's perspective; patches and
//! calls issued while the link is down are dropped silently and must be
//! re-issued after the next Connected/Reconnected transition. State is
//! last-writer-wins per leaf path with no convergence guarantee under
//! racing writers. A call whose callee never answers never completes.

pub mod protocol;
pub mod relay;
pub mod router;
pub mod rpc;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use protocol::{Frame, ProtocolError};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use router::{filter_matches, TopicCallback, TopicRouter};
pub use rpc::{CallRequest, CallReturn, RpcEndpoint, RpcHandler};
pub use state::{ChangeCallback, StateSync};
pub use transport::{
    BrokerConfig, BrokerLink, ConnectionState, DeliveryCallback, StateCallback,
};
