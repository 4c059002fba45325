//! Local peer media stack seam
//!
//! The browser-side WebRTC machinery (device loading, ICE agent, DTLS,
//! encoders and decoders) sits behind [`PeerMediaStack`]. The session only
//! feeds it the parameter blobs the server hands out and listens for its
//! connectivity events.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::network::SignalingError;
use crate::protocol::{
    ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportConnectionParams, TransportDirection, TransportId,
};

/// Connectivity events of a local transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStackEvent {
    /// ICE and DTLS completed
    Connected,
    /// ICE or DTLS failed, or connectivity was lost later on
    Failed,
    /// The transport was closed locally
    Closed,
}

/// A transport built by the local stack from server connection params
#[derive(Debug)]
pub struct LocalTransport {
    /// Local DTLS parameters to hand to the server exactly once
    pub dtls_parameters: DtlsParameters,
    pub events: mpsc::UnboundedReceiver<MediaStackEvent>,
}

#[async_trait]
pub trait PeerMediaStack: Send + Sync + 'static {
    /// Load the router's capabilities; returns what this device can receive
    async fn load(
        &self,
        router_capabilities: &RtpCapabilities,
    ) -> Result<RtpCapabilities, SignalingError>;

    /// Build the local side of a transport; starts ICE immediately
    async fn create_transport(
        &self,
        direction: TransportDirection,
        params: &TransportConnectionParams,
    ) -> Result<LocalTransport, SignalingError>;

    /// RTP parameters the local encoder will send for a track of `kind`
    async fn send_parameters(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
    ) -> Result<RtpParameters, SignalingError>;

    /// Attach a server-side consumer to a local receive transport
    async fn receive(
        &self,
        transport_id: TransportId,
        consumer: &ConsumerParams,
    ) -> Result<(), SignalingError>;

    /// Release the local transport; takes effect immediately
    fn close_transport(&self, transport_id: TransportId);
}
