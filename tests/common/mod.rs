//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use sfu_signal::client::{intersect_capabilities, LocalTransport, MediaStackEvent, PeerMediaStack};
use sfu_signal::config::{EngineSettings, ServerConfig};
use sfu_signal::engine::LoopbackEngine;
use sfu_signal::network::{SignalingError, SignalingServer};
use sfu_signal::protocol::{
    ConsumerParams, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TransportConnectionParams,
    TransportDirection, TransportId,
};

/// Find an available port for testing
pub fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Start a signaling server in background over a fresh loopback engine
pub async fn start_test_server(port: u16) -> (Arc<LoopbackEngine>, tokio::task::JoinHandle<()>) {
    let addr = format!("127.0.0.1:{}", port);
    let engine = Arc::new(LoopbackEngine::new(EngineSettings::default()));
    let config = ServerConfig {
        request_timeout_ms: 2_000,
        ..ServerConfig::default()
    };
    let server = SignalingServer::new(engine.clone(), &config);

    let handle = tokio::spawn(async move {
        // Server runs until cancelled
        let _ = server.run(&addr).await;
    });

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (engine, handle)
}

pub fn server_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}", port)
}

/// Poll `check` until it holds or a second has passed
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AA:BB:CC:DD".to_string(),
        }],
    }
}

/// RTP parameters for sending `kind` with the matching codec in `caps`
pub fn send_parameters_for(caps: &RtpCapabilities, kind: MediaKind) -> Option<RtpParameters> {
    let codec = caps.codecs.iter().find(|c| c.kind == kind)?;
    Some(RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: codec.mime_type.clone(),
            payload_type: codec.preferred_payload_type.unwrap_or(96),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: codec.parameters.clone(),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(1111),
            ..RtpEncodingParameters::default()
        }],
        header_extensions: Vec::new(),
    })
}

/// How the scripted stack's transports behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Succeeds,
    Fails,
}

/// Scripted local media stack
pub struct FakeMediaStack {
    device: RtpCapabilities,
    handshake: Handshake,
    loaded: Mutex<Option<RtpCapabilities>>,
    transports: Mutex<HashMap<TransportId, mpsc::UnboundedSender<MediaStackEvent>>>,
    created: Mutex<Vec<(TransportDirection, TransportId)>>,
    closed: Mutex<Vec<TransportId>>,
    received: Mutex<Vec<ConsumerParams>>,
}

impl FakeMediaStack {
    /// A device supporting every default router codec
    pub fn new() -> Self {
        Self::with_device(RtpCapabilities {
            codecs: EngineSettings::default().media_codecs,
            header_extensions: Vec::new(),
        })
    }

    /// A device that can only handle audio
    pub fn audio_only() -> Self {
        Self::with_device(RtpCapabilities {
            codecs: EngineSettings::default()
                .media_codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: Vec::new(),
        })
    }

    pub fn with_device(device: RtpCapabilities) -> Self {
        Self {
            device,
            handshake: Handshake::Succeeds,
            loaded: Mutex::new(None),
            transports: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    /// Report ICE/DTLS loss on an open transport
    pub fn lose_connectivity(&self, transport_id: TransportId) -> bool {
        match self.transports.lock().get(&transport_id) {
            Some(tx) => tx.send(MediaStackEvent::Failed).is_ok(),
            None => false,
        }
    }

    /// Most recently created transport of `direction` that is still open
    pub fn open_transport(&self, direction: TransportDirection) -> Option<TransportId> {
        let open = self.transports.lock();
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(d, id)| *d == direction && open.contains_key(id))
            .map(|(_, id)| *id)
    }

    pub fn open_transports(&self) -> Vec<TransportId> {
        self.transports.lock().keys().copied().collect()
    }

    pub fn closed_transports(&self) -> Vec<TransportId> {
        self.closed.lock().clone()
    }

    pub fn received(&self) -> Vec<ConsumerParams> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl PeerMediaStack for FakeMediaStack {
    async fn load(
        &self,
        router_capabilities: &RtpCapabilities,
    ) -> Result<RtpCapabilities, SignalingError> {
        let local = intersect_capabilities(router_capabilities, &self.device);
        *self.loaded.lock() = Some(local.clone());
        Ok(local)
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        params: &TransportConnectionParams,
    ) -> Result<LocalTransport, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let event = match self.handshake {
            Handshake::Succeeds => MediaStackEvent::Connected,
            Handshake::Fails => MediaStackEvent::Failed,
        };
        let _ = tx.send(event);
        self.transports.lock().insert(params.id, tx);
        self.created.lock().push((direction, params.id));
        Ok(LocalTransport {
            dtls_parameters: client_dtls(),
            events: rx,
        })
    }

    async fn send_parameters(
        &self,
        _transport_id: TransportId,
        kind: MediaKind,
    ) -> Result<RtpParameters, SignalingError> {
        let loaded = self.loaded.lock().clone();
        loaded
            .as_ref()
            .and_then(|caps| send_parameters_for(caps, kind))
            .ok_or_else(|| SignalingError::NotReady(format!("no {} codec loaded", kind)))
    }

    async fn receive(
        &self,
        _transport_id: TransportId,
        consumer: &ConsumerParams,
    ) -> Result<(), SignalingError> {
        self.received.lock().push(consumer.clone());
        Ok(())
    }

    fn close_transport(&self, transport_id: TransportId) {
        if let Some(tx) = self.transports.lock().remove(&transport_id) {
            let _ = tx.send(MediaStackEvent::Closed);
        }
        self.closed.lock().push(transport_id);
    }
}
