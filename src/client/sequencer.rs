//! Transport negotiation sequencer
//!
//! Drives one transport through its handshake:
//!
//! ```text
//! create (server) --> build locally (new -> connecting)
//!     --> connect with local DTLS parameters (exactly once)
//!     --> wait for ICE/DTLS --> connected | failed
//! ```
//!
//! Producing or consuming on the transport happens only once it is connected.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::media_stack::{MediaStackEvent, PeerMediaStack};
use crate::network::{RpcChannel, SignalingError};
use crate::protocol::{DtlsParameters, TransportConnectionParams, TransportDirection, TransportId};

/// Client-side transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One transport under negotiation
pub struct TransportSequencer {
    id: TransportId,
    direction: TransportDirection,
    state: TransportState,
    local_dtls: Option<DtlsParameters>,
    connect_confirmed: bool,
    events: Option<mpsc::UnboundedReceiver<MediaStackEvent>>,
}

impl TransportSequencer {
    /// Create the server transport and build its local side
    ///
    /// If the local side cannot be built, the server transport is released
    /// before the error is returned.
    pub async fn open(
        channel: &RpcChannel,
        stack: &dyn PeerMediaStack,
        direction: TransportDirection,
    ) -> Result<Self, SignalingError> {
        let params = channel.create_transport(direction).await?;
        Self::build(channel, stack, direction, params).await
    }

    /// Build the local side for an already created server transport
    pub async fn build(
        channel: &RpcChannel,
        stack: &dyn PeerMediaStack,
        direction: TransportDirection,
        params: TransportConnectionParams,
    ) -> Result<Self, SignalingError> {
        let id = params.id;
        let local = match stack.create_transport(direction, &params).await {
            Ok(local) => local,
            Err(e) => {
                warn!("Local {} transport {} could not be built: {}", direction, id, e);
                release_remote(channel, id).await;
                return Err(e);
            }
        };

        debug!("{} transport {}: new -> connecting", direction, id);
        Ok(Self {
            id,
            direction,
            state: TransportState::Connecting,
            local_dtls: Some(local.dtls_parameters),
            connect_confirmed: false,
            events: Some(local.events),
        })
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Hand the local DTLS parameters to the server
    ///
    /// A failed attempt may be retried; once the server has confirmed, any
    /// further call fails with `InvalidState`.
    pub async fn connect(&mut self, channel: &RpcChannel) -> Result<(), SignalingError> {
        if self.connect_confirmed {
            return Err(SignalingError::InvalidState(format!(
                "transport {} already connected to the server",
                self.id
            )));
        }
        if matches!(self.state, TransportState::Failed | TransportState::Closed) {
            return Err(SignalingError::InvalidState(format!(
                "transport {} is {}",
                self.id, self.state
            )));
        }
        let dtls = match &self.local_dtls {
            Some(dtls) => dtls.clone(),
            None => {
                return Err(SignalingError::InvalidState(format!(
                    "transport {} has no local DTLS parameters",
                    self.id
                )));
            }
        };

        channel.connect_transport(self.direction, self.id, dtls).await?;
        self.connect_confirmed = true;
        self.local_dtls = None;
        debug!("{} transport {}: server has DTLS parameters", self.direction, self.id);
        Ok(())
    }

    /// Wait for the local stack to report ICE/DTLS completion
    pub async fn wait_connected(&mut self, limit: Duration) -> Result<(), SignalingError> {
        if self.state == TransportState::Connected {
            return Ok(());
        }
        let Some(events) = self.events.as_mut() else {
            return Err(SignalingError::InvalidState(format!(
                "transport {} is not being watched",
                self.id
            )));
        };

        let outcome = tokio::time::timeout(limit, async {
            loop {
                match events.recv().await {
                    Some(MediaStackEvent::Connected) => return Ok(()),
                    Some(MediaStackEvent::Failed) => {
                        return Err(SignalingError::ConnectivityLost(
                            "ICE/DTLS handshake failed".to_string(),
                        ))
                    }
                    Some(MediaStackEvent::Closed) | None => {
                        return Err(SignalingError::ConnectivityLost(
                            "transport closed during handshake".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.state = TransportState::Connected;
                info!("{} transport {} connected", self.direction, self.id);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = TransportState::Failed;
                Err(e)
            }
            Err(_) => {
                self.state = TransportState::Failed;
                Err(SignalingError::Timeout {
                    method: "transport handshake".to_string(),
                    after: limit,
                })
            }
        }
    }

    /// Event stream for watching the transport after the handshake
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MediaStackEvent>> {
        self.events.take()
    }

    /// Release the local side now, then the server side
    ///
    /// Server errors are logged; the transport counts as closed either way.
    pub async fn close(&mut self, channel: &RpcChannel, stack: &dyn PeerMediaStack) {
        if self.state == TransportState::Closed {
            return;
        }
        self.close_local(stack);
        release_remote(channel, self.id).await;
    }

    /// Release only the local side
    pub fn close_local(&mut self, stack: &dyn PeerMediaStack) {
        if self.state == TransportState::Closed {
            return;
        }
        stack.close_transport(self.id);
        self.state = TransportState::Closed;
        self.events = None;
        debug!("{} transport {} closed locally", self.direction, self.id);
    }
}

/// Best-effort release of a server transport
pub(crate) async fn release_remote(channel: &RpcChannel, transport_id: TransportId) {
    match channel.close_transport(transport_id).await {
        Ok(()) => debug!("Server released transport {}", transport_id),
        Err(SignalingError::UnknownResource(_)) => {
            debug!("Transport {} was already gone on the server", transport_id)
        }
        Err(e) => warn!("Could not release transport {}: {}", transport_id, e),
    }
}
