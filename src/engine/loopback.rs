//! In-process media engine
//!
//! Allocates transports, producers and consumers, synthesizes ICE/DTLS
//! parameters from the configured listen address and port range, and runs
//! the codec compatibility check. It forwards no media; it is what the
//! server runs when no external SFU is attached, and what the tests drive.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ConsumerDescription, EngineError, EngineEvent, MediaEngine, ProducerInfo,
};
use crate::config::EngineSettings;
use crate::protocol::{
    ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, IceProtocol, MediaKind, ProducerId, RtpCapabilities, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, TransportConnectionParams, TransportDirection,
    TransportId,
};

/// Capacity of the engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Priority mediasoup assigns to its single UDP host candidate
const HOST_CANDIDATE_PRIORITY: u32 = 1_076_302_079;

struct TransportEntry {
    direction: TransportDirection,
    port: u16,
    connected: bool,
    max_incoming_bitrate: u32,
    available_outgoing_bitrate: u32,
}

struct ProducerEntry {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
}

struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
    preferred_layers: Option<(u8, u8)>,
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Producer ids in creation order
    producer_order: Vec<ProducerId>,
    used_ports: HashSet<u16>,
    next_port: u16,
}

/// A media engine that negotiates but does not route media
pub struct LoopbackEngine {
    settings: EngineSettings,
    capabilities: RtpCapabilities,
    fingerprint: DtlsFingerprint,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl LoopbackEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let capabilities = RtpCapabilities {
            codecs: settings.media_codecs.clone(),
            header_extensions: Vec::new(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = EngineState {
            next_port: settings.rtc_min_port,
            ..EngineState::default()
        };

        info!(
            "Loopback media engine on {} (ports {}-{}, {} codecs)",
            settings.listen_ip,
            settings.rtc_min_port,
            settings.rtc_max_port,
            capabilities.codecs.len()
        );

        Self {
            settings,
            capabilities,
            fingerprint: generate_fingerprint(),
            state: Mutex::new(state),
            events,
        }
    }

    /// Report an ICE/DTLS failure on a transport, as the network layer would
    pub fn fail_transport(&self, transport_id: TransportId) -> Result<(), EngineError> {
        if !self.state.lock().transports.contains_key(&transport_id) {
            return Err(EngineError::UnknownTransport(transport_id));
        }
        warn!("Transport {} failed (ICE/DTLS)", transport_id);
        let _ = self.events.send(EngineEvent::TransportFailed { transport_id });
        Ok(())
    }

    pub fn pause_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let producer = state
            .producers
            .get_mut(&producer_id)
            .ok_or(EngineError::UnknownProducer(producer_id))?;
        producer.paused = true;
        Ok(())
    }

    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub fn is_consumer_paused(&self, consumer_id: ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(&consumer_id).map(|c| c.paused)
    }

    pub fn preferred_layers(&self, consumer_id: ConsumerId) -> Option<(u8, u8)> {
        self.state
            .lock()
            .consumers
            .get(&consumer_id)
            .and_then(|c| c.preferred_layers)
    }

    pub fn max_incoming_bitrate(&self, transport_id: TransportId) -> Option<u32> {
        self.state
            .lock()
            .transports
            .get(&transport_id)
            .map(|t| t.max_incoming_bitrate)
    }

    /// Outgoing bandwidth estimate a transport starts from
    pub fn available_outgoing_bitrate(&self, transport_id: TransportId) -> Option<u32> {
        self.state
            .lock()
            .transports
            .get(&transport_id)
            .map(|t| t.available_outgoing_bitrate)
    }

    fn allocate_port(&self, state: &mut EngineState) -> Result<u16, EngineError> {
        let min = self.settings.rtc_min_port;
        let max = self.settings.rtc_max_port;
        let range = u32::from(max - min) + 1;

        for _ in 0..range {
            let port = state.next_port;
            state.next_port = if port >= max { min } else { port + 1 };
            if state.used_ports.insert(port) {
                return Ok(port);
            }
        }
        Err(EngineError::PortsExhausted { min, max })
    }

    /// Every codec the producer sends must be receivable with `caps`
    fn codecs_compatible(rtp_parameters: &RtpParameters, caps: &RtpCapabilities) -> bool {
        !rtp_parameters.codecs.is_empty()
            && rtp_parameters
                .codecs
                .iter()
                .all(|codec| caps.find_codec(&codec.mime_type, codec.clock_rate).is_some())
    }

    /// Remove a producer and its consumers; caller holds the lock
    fn remove_producer(state: &mut EngineState, producer_id: ProducerId) -> bool {
        if state.producers.remove(&producer_id).is_none() {
            return false;
        }
        state.producer_order.retain(|id| *id != producer_id);
        state.consumers.retain(|_, c| c.producer_id != producer_id);
        true
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers simply means no session is listening
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportConnectionParams, EngineError> {
        let id = Uuid::new_v4();
        let port = {
            let mut state = self.state.lock();
            let port = self.allocate_port(&mut state)?;
            state.transports.insert(
                id,
                TransportEntry {
                    direction,
                    port,
                    connected: false,
                    max_incoming_bitrate: self.settings.max_incoming_bitrate,
                    available_outgoing_bitrate: self
                        .settings
                        .initial_available_outgoing_bitrate,
                },
            );
            port
        };

        debug!("Created {} transport {} on port {}", direction, id, port);

        Ok(TransportConnectionParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                ip: self.settings.candidate_ip().to_string(),
                protocol: IceProtocol::Udp,
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![self.fingerprint.clone()],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;
        if transport.connected {
            return Err(EngineError::AlreadyConnected(transport_id));
        }
        transport.connected = true;

        debug!(
            "Transport {} connected (remote role {:?})",
            transport_id, dtls_parameters.role
        );
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        if !self.capabilities.supports_kind(kind) {
            return Err(EngineError::Unsupported(format!(
                "router has no {} codec",
                kind
            )));
        }
        if !Self::codecs_compatible(&rtp_parameters, &self.capabilities) {
            return Err(EngineError::Unsupported(
                "producer codecs are not offered by the router".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;
        if transport.direction != TransportDirection::Send {
            return Err(EngineError::Unsupported(format!(
                "transport {} cannot send",
                transport_id
            )));
        }

        let id = Uuid::new_v4();
        state.producers.insert(
            id,
            ProducerEntry {
                transport_id,
                kind,
                rtp_parameters,
                paused: false,
            },
        );
        state.producer_order.push(id);

        info!("Producer {} ({}) created on {}", id, kind, transport_id);
        Ok(id)
    }

    fn producer(&self, producer_id: ProducerId) -> Option<ProducerInfo> {
        self.state
            .lock()
            .producers
            .get(&producer_id)
            .map(|p| ProducerInfo {
                id: producer_id,
                kind: p.kind,
                paused: p.paused,
            })
    }

    fn latest_producer(&self) -> Option<ProducerId> {
        self.state.lock().producer_order.last().copied()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.state.lock();
        match state.producers.get(&producer_id) {
            Some(producer) => Self::codecs_compatible(&producer.rtp_parameters, rtp_capabilities),
            None => false,
        }
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescription, EngineError> {
        let mut state = self.state.lock();

        let transport = state
            .transports
            .get(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::Unsupported(format!(
                "transport {} cannot receive",
                transport_id
            )));
        }

        let producer = state
            .producers
            .get(&producer_id)
            .ok_or(EngineError::UnknownProducer(producer_id))?;
        if !Self::codecs_compatible(&producer.rtp_parameters, rtp_capabilities) {
            return Err(EngineError::Unsupported(
                "consumer capabilities do not cover producer codecs".to_string(),
            ));
        }

        let codecs = producer
            .rtp_parameters
            .codecs
            .iter()
            .map(|codec| {
                let payload_type = rtp_capabilities
                    .find_codec(&codec.mime_type, codec.clock_rate)
                    .and_then(|c| c.preferred_payload_type)
                    .unwrap_or(codec.payload_type);
                RtpCodecParameters {
                    payload_type,
                    ..codec.clone()
                }
            })
            .collect();

        let consumer_type = if producer.rtp_parameters.is_simulcast() {
            ConsumerType::Simulcast
        } else {
            ConsumerType::Simple
        };
        let kind = producer.kind;
        let producer_paused = producer.paused;

        let id = Uuid::new_v4();
        let rtp_parameters = RtpParameters {
            mid: Some(state.consumers.len().to_string()),
            codecs,
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::thread_rng().gen()),
                ..RtpEncodingParameters::default()
            }],
            header_extensions: Vec::new(),
        };

        state.consumers.insert(
            id,
            ConsumerEntry {
                transport_id,
                producer_id,
                paused,
                preferred_layers: None,
            },
        );

        info!(
            "Consumer {} ({}) of producer {} created on {}",
            id, kind, producer_id, transport_id
        );

        Ok(ConsumerDescription {
            id,
            kind,
            rtp_parameters,
            consumer_type,
            producer_paused,
        })
    }

    async fn set_preferred_layers(
        &self,
        consumer_id: ConsumerId,
        spatial_layer: u8,
        temporal_layer: u8,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::UnknownConsumer(consumer_id))?;
        consumer.preferred_layers = Some((spatial_layer, temporal_layer));
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::UnknownConsumer(consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        let removed = self.state.lock().consumers.remove(&consumer_id);
        match removed {
            Some(_) => {
                debug!("Consumer {} closed", consumer_id);
                Ok(())
            }
            None => Err(EngineError::UnknownConsumer(consumer_id)),
        }
    }

    fn close_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        let removed = Self::remove_producer(&mut self.state.lock(), producer_id);
        if !removed {
            return Err(EngineError::UnknownProducer(producer_id));
        }
        debug!("Producer {} closed", producer_id);
        self.emit(EngineEvent::ProducerClosed { producer_id });
        Ok(())
    }

    fn close_transport(&self, transport_id: TransportId) -> Result<(), EngineError> {
        let closed_producers = {
            let mut state = self.state.lock();
            let transport = state
                .transports
                .remove(&transport_id)
                .ok_or(EngineError::UnknownTransport(transport_id))?;
            state.used_ports.remove(&transport.port);

            let producers: Vec<ProducerId> = state
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == transport_id)
                .map(|(id, _)| *id)
                .collect();
            for producer_id in &producers {
                Self::remove_producer(&mut state, *producer_id);
            }
            state.consumers.retain(|_, c| c.transport_id != transport_id);
            producers
        };

        debug!("Transport {} closed", transport_id);
        for producer_id in closed_producers {
            self.emit(EngineEvent::ProducerClosed { producer_id });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// SHA-256 fingerprint of a throwaway certificate body
fn generate_fingerprint() -> DtlsFingerprint {
    let mut der = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut der);
    let digest = Sha256::digest(der);
    let value = digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");

    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}
