//! Signaling network layer
//!
//! WebSocket server with one session coordinator per connection, and the
//! client-side RPC channel.

mod coordinator;
mod error;
mod rpc;
mod server;

pub use coordinator::{SessionCoordinator, TransportState as ServerTransportState};
pub use error::SignalingError;
pub use rpc::{RpcChannel, SignalingClient};
pub use server::SignalingServer;
