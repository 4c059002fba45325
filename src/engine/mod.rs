//! Media engine seam
//!
//! The SFU itself (RTP routing, ICE/DTLS termination, bandwidth estimation)
//! lives behind [`MediaEngine`]. Sessions only ask it to allocate and release
//! transports, producers and consumers, and relay the parameter blobs it
//! hands back.

mod error;
mod loopback;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::{
    ConsumerId, ConsumerType, DtlsParameters, MediaKind, ProducerId, RtpCapabilities,
    RtpParameters, TransportConnectionParams, TransportDirection, TransportId,
};

pub use error::EngineError;
pub use loopback::LoopbackEngine;

/// Spatial/temporal layer preferred for simulcast consumers
pub const PREFERRED_SIMULCAST_LAYERS: (u8, u8) = (2, 2);

/// Events raised by the engine independently of any request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A producer is gone; every consumer of it has been closed
    ProducerClosed { producer_id: ProducerId },
    /// ICE or DTLS on a transport failed
    TransportFailed { transport_id: TransportId },
}

/// Snapshot of a live producer
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// A consumer as created by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescription {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

/// Operations the signaling core needs from an SFU
///
/// Close operations are synchronous: local resources are released before they
/// return, whatever the network later does.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Router capabilities, shared read-only by every session
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportConnectionParams, EngineError>;

    /// Hand the peer's DTLS parameters to the engine's side of the handshake
    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    fn producer(&self, producer_id: ProducerId) -> Option<ProducerInfo>;

    /// Most recently created producer that is still alive
    fn latest_producer(&self) -> Option<ProducerId>;

    /// Whether `rtp_capabilities` can receive what the producer sends
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescription, EngineError>;

    async fn set_preferred_layers(
        &self,
        consumer_id: ConsumerId,
        spatial_layer: u8,
        temporal_layer: u8,
    ) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    /// Closes the producer and every consumer of it
    fn close_producer(&self, producer_id: ProducerId) -> Result<(), EngineError>;

    /// Closes the transport and every producer/consumer on it
    fn close_transport(&self, transport_id: TransportId) -> Result<(), EngineError>;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
