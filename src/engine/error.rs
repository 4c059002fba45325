//! Media engine error types

use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a media engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport not found: {0}")]
    UnknownTransport(Uuid),

    #[error("Producer not found: {0}")]
    UnknownProducer(Uuid),

    #[error("Consumer not found: {0}")]
    UnknownConsumer(Uuid),

    #[error("Transport {0} is already connected")]
    AlreadyConnected(Uuid),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("No free RTC port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },
}
