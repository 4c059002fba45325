//! sfu-signal - Session signaling for a selective forwarding unit
//!
//! This library provides the signaling layer between browser clients and an
//! SFU media engine: the JSON-over-WebSocket RPC protocol, a per-connection
//! session coordinator on the server, and the client-side negotiation and
//! session state machine.

pub mod client;
pub mod config;
pub mod engine;
pub mod network;
pub mod protocol;

pub use client::{ClientSession, ConnectionState, PeerMediaStack, StateChange};
pub use config::{ClientConfig, ServerConfig};
pub use engine::{LoopbackEngine, MediaEngine};
pub use network::{RpcChannel, SignalingClient, SignalingError, SignalingServer};
