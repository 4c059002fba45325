//! Signaling error types

use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;
use crate::protocol::{ErrorCode, RpcFailure};

/// Errors that can occur in the signaling subsystem
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The referenced transport/producer/consumer is not owned by this session
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// A prerequisite transport or producer is not in the required state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Capabilities have not been negotiated yet
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// ICE/DTLS connectivity was lost on a transport
    #[error("Connectivity lost: {0}")]
    ConnectivityLost(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unexpected reply to '{method}'")]
    UnexpectedReply { method: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalingError {
    /// Rebuild a typed error from a wire failure
    pub fn from_failure(method: &str, failure: RpcFailure) -> Self {
        match failure.code {
            ErrorCode::UnknownResource => SignalingError::UnknownResource(failure.message),
            ErrorCode::InvalidState => SignalingError::InvalidState(failure.message),
            ErrorCode::NotReady => SignalingError::NotReady(failure.message),
            ErrorCode::Engine => SignalingError::Engine(failure.message),
            ErrorCode::BadRequest => SignalingError::BadRequest(failure.message),
            ErrorCode::Timeout => SignalingError::Timeout {
                method: method.to_string(),
                after: Duration::ZERO,
            },
        }
    }

    /// Wire representation of this error for a response frame
    pub fn to_failure(&self) -> RpcFailure {
        let code = match self {
            SignalingError::UnknownResource(_) => ErrorCode::UnknownResource,
            SignalingError::InvalidState(_) => ErrorCode::InvalidState,
            SignalingError::NotReady(_) => ErrorCode::NotReady,
            SignalingError::Timeout { .. } => ErrorCode::Timeout,
            SignalingError::BadRequest(_) | SignalingError::Serialization(_) => {
                ErrorCode::BadRequest
            }
            _ => ErrorCode::Engine,
        };
        RpcFailure::new(code, self.to_string())
    }
}

impl From<EngineError> for SignalingError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownTransport(_)
            | EngineError::UnknownProducer(_)
            | EngineError::UnknownConsumer(_) => SignalingError::UnknownResource(err.to_string()),
            EngineError::AlreadyConnected(_) => SignalingError::InvalidState(err.to_string()),
            EngineError::InvalidParameters(_) => SignalingError::BadRequest(err.to_string()),
            _ => SignalingError::Engine(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalingError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SignalingError::WebSocket(err.to_string())
    }
}
