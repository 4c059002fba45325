//! Client side of a session
//!
//! Capability negotiation, the per-transport handshake sequence and the
//! session state machine. Browser media machinery is abstracted by
//! [`PeerMediaStack`].

mod media_stack;
mod negotiator;
mod sequencer;
mod session;
mod state;

pub use media_stack::{LocalTransport, MediaStackEvent, PeerMediaStack};
pub use negotiator::{intersect_capabilities, NegotiatedCapabilities};
pub use sequencer::{TransportSequencer, TransportState};
pub use session::ClientSession;
pub use state::{ConnectionState, SessionState, StateCallback, StateChange};
