//! Per-connection session coordinator
//!
//! One coordinator exists per signaling connection. It owns every transport,
//! producer and consumer that connection created, keyed by id, and releases
//! all of them when the connection goes away.
//!
//! Every engine await made while handling a request is bounded by the
//! request timeout, so a handler always runs to completion.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::SignalingError;
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::engine::{
    ConsumerDescription, EngineError, EngineEvent, MediaEngine, PREFERRED_SIMULCAST_LAYERS,
};
use crate::protocol::{
    ConsumeOutcome, ConsumerId, ConsumerParams, ConsumerType, DtlsParameters, MediaKind,
    Notification, ProducerId, Reply, Request, RtpCapabilities, RtpParameters,
    TransportConnectionParams, TransportDirection, TransportId,
};

/// Server-side transport state
///
/// ```text
/// New --> Connecting: connect request
/// Connecting --> Connected: engine acknowledged DTLS parameters
/// Connecting --> New: engine rejected them or did not answer in time
///                    (connect may be retried)
/// Connected --> Failed: ICE/DTLS failure reported by the engine
/// any --> Closed
/// ```
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
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An entry in the session's resource registry
#[derive(Debug, Clone)]
enum Resource {
    Transport {
        direction: TransportDirection,
        state: TransportState,
    },
    Producer {
        transport_id: TransportId,
        kind: MediaKind,
    },
    Consumer {
        transport_id: TransportId,
        producer_id: ProducerId,
    },
}

/// Owns one connection's media resources and answers its requests
pub struct SessionCoordinator {
    session_id: Uuid,
    engine: Arc<dyn MediaEngine>,
    resources: HashMap<Uuid, Resource>,
    request_timeout: Duration,
}

impl SessionCoordinator {
    pub fn new(session_id: Uuid, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            session_id,
            engine,
            resources: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound for each engine call made while handling a request
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// State of a transport owned by this session
    pub fn transport_state(&self, transport_id: TransportId) -> Option<TransportState> {
        match self.resources.get(&transport_id) {
            Some(Resource::Transport { state, .. }) => Some(*state),
            _ => None,
        }
    }

    pub fn transport_count(&self) -> usize {
        self.count(|r| matches!(r, Resource::Transport { .. }))
    }

    pub fn producer_count(&self) -> usize {
        self.count(|r| matches!(r, Resource::Producer { .. }))
    }

    pub fn consumer_count(&self) -> usize {
        self.count(|r| matches!(r, Resource::Consumer { .. }))
    }

    fn count(&self, pred: impl Fn(&Resource) -> bool) -> usize {
        self.resources.values().filter(|r| pred(r)).count()
    }

    /// Run the handler for one request
    pub async fn handle(&mut self, request: Request) -> Result<Reply, SignalingError> {
        let method = request.method();
        match request {
            Request::GetRouterRtpCapabilities => {
                Ok(Reply::RtpCapabilities(self.engine.rtp_capabilities()))
            }
            Request::CreateProducerTransport => {
                self.create_transport(method, TransportDirection::Send).await
            }
            Request::CreateConsumerTransport => {
                self.create_transport(method, TransportDirection::Recv).await
            }
            Request::ConnectProducerTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(method, TransportDirection::Send, transport_id, dtls_parameters)
                    .await
            }
            Request::ConnectConsumerTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(method, TransportDirection::Recv, transport_id, dtls_parameters)
                    .await
            }
            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(method, transport_id, kind, rtp_parameters).await,
            Request::Consume {
                transport_id,
                rtp_capabilities,
                producer_id,
            } => {
                self.consume(method, transport_id, rtp_capabilities, producer_id)
                    .await
            }
            Request::Resume { consumer_id } => self.resume(method, consumer_id).await,
            Request::Unpublish { producer_id } => self.unpublish(producer_id),
            Request::Unsubscribe { consumer_id } => self.unsubscribe(consumer_id),
            Request::CloseTransport { transport_id } => {
                self.owned_transport(transport_id, None)?;
                self.close_transport(transport_id, TransportState::Closed);
                Ok(Reply::Ack)
            }
        }
    }

    async fn create_transport(
        &mut self,
        method: &'static str,
        direction: TransportDirection,
    ) -> Result<Reply, SignalingError> {
        let engine = self.engine.clone();
        let params = self
            .allocate(
                method,
                async move { engine.create_webrtc_transport(direction).await },
                |engine, params: &TransportConnectionParams| engine.close_transport(params.id),
            )
            .await?;
        self.resources.insert(
            params.id,
            Resource::Transport {
                direction,
                state: TransportState::New,
            },
        );
        info!(
            "Session {}: {} transport {} created",
            self.session_id, direction, params.id
        );
        Ok(Reply::TransportCreated(params))
    }

    async fn connect_transport(
        &mut self,
        method: &'static str,
        direction: TransportDirection,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<Reply, SignalingError> {
        match self.owned_transport(transport_id, Some(direction))? {
            TransportState::New => {}
            state => {
                return Err(SignalingError::InvalidState(format!(
                    "transport {} is {}, connect was already issued",
                    transport_id, state
                )));
            }
        }

        self.set_transport_state(transport_id, TransportState::Connecting);
        let result = self
            .bounded(
                method,
                self.engine.connect_transport(transport_id, dtls_parameters),
            )
            .await;
        match result {
            Ok(()) => {
                self.set_transport_state(transport_id, TransportState::Connected);
                debug!(
                    "Session {}: transport {} connected",
                    self.session_id, transport_id
                );
                Ok(Reply::Ack)
            }
            Err(e) => {
                // Nothing succeeded yet, so a retry is still allowed
                self.set_transport_state(transport_id, TransportState::New);
                Err(e)
            }
        }
    }

    async fn produce(
        &mut self,
        method: &'static str,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Reply, SignalingError> {
        let state = self.owned_transport(transport_id, Some(TransportDirection::Send))?;
        if state != TransportState::Connected {
            return Err(SignalingError::InvalidState(format!(
                "transport {} is {}, not connected",
                transport_id, state
            )));
        }

        let engine = self.engine.clone();
        let producer_id = self
            .allocate(
                method,
                async move { engine.produce(transport_id, kind, rtp_parameters).await },
                |engine, producer_id: &ProducerId| engine.close_producer(*producer_id),
            )
            .await?;
        self.resources.insert(
            producer_id,
            Resource::Producer { transport_id, kind },
        );
        info!(
            "Session {}: producing {} as {}",
            self.session_id, kind, producer_id
        );
        Ok(Reply::Produced { producer_id })
    }

    async fn consume(
        &mut self,
        method: &'static str,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
        producer_id: Option<ProducerId>,
    ) -> Result<Reply, SignalingError> {
        self.owned_transport(transport_id, Some(TransportDirection::Recv))?;

        let Some(producer_id) = producer_id.or_else(|| self.engine.latest_producer()) else {
            return Ok(Reply::Consumed(ConsumeOutcome::unavailable(
                "no producer available",
            )));
        };
        let Some(producer) = self.engine.producer(producer_id) else {
            return Ok(Reply::Consumed(ConsumeOutcome::unavailable(format!(
                "producer {} not found",
                producer_id
            ))));
        };

        // Checked right before creation, never ahead of time
        if !self.engine.can_consume(producer_id, &rtp_capabilities) {
            warn!(
                "Session {}: cannot consume producer {} with given capabilities",
                self.session_id, producer_id
            );
            return Ok(Reply::Consumed(ConsumeOutcome::unavailable(
                "capabilities cannot consume producer",
            )));
        }

        let paused = producer.paused || producer.kind == MediaKind::Video;
        let engine = self.engine.clone();
        let consumer = match self
            .allocate(
                method,
                async move {
                    engine
                        .consume(transport_id, producer_id, &rtp_capabilities, paused)
                        .await
                },
                |engine, consumer: &ConsumerDescription| engine.close_consumer(consumer.id),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e @ SignalingError::Timeout { .. }) => return Err(e),
            Err(e) => {
                error!(
                    "Session {}: consume of {} failed: {}",
                    self.session_id, producer_id, e
                );
                return Ok(Reply::Consumed(ConsumeOutcome::unavailable(e.to_string())));
            }
        };

        self.resources.insert(
            consumer.id,
            Resource::Consumer {
                transport_id,
                producer_id,
            },
        );

        if consumer.consumer_type == ConsumerType::Simulcast {
            let (spatial, temporal) = PREFERRED_SIMULCAST_LAYERS;
            if let Err(e) = self
                .bounded(
                    method,
                    self.engine
                        .set_preferred_layers(consumer.id, spatial, temporal),
                )
                .await
            {
                warn!(
                    "Session {}: could not set preferred layers on {}: {}",
                    self.session_id, consumer.id, e
                );
            }
        }

        info!(
            "Session {}: consuming {} as {} (paused={})",
            self.session_id, producer_id, consumer.id, paused
        );

        Ok(Reply::Consumed(ConsumeOutcome::Consumer(ConsumerParams {
            producer_id,
            id: consumer.id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            consumer_type: consumer.consumer_type,
            producer_paused: consumer.producer_paused,
        })))
    }

    async fn resume(
        &mut self,
        method: &'static str,
        consumer_id: ConsumerId,
    ) -> Result<Reply, SignalingError> {
        match self.resources.get(&consumer_id) {
            Some(Resource::Consumer { .. }) => {}
            _ => return Err(unknown("consumer", consumer_id)),
        }
        self.bounded(method, self.engine.resume_consumer(consumer_id))
            .await?;
        debug!("Session {}: consumer {} resumed", self.session_id, consumer_id);
        Ok(Reply::Ack)
    }

    fn unpublish(&mut self, producer_id: ProducerId) -> Result<Reply, SignalingError> {
        match self.resources.get(&producer_id) {
            Some(Resource::Producer { .. }) => {}
            _ => return Err(unknown("producer", producer_id)),
        }
        self.resources.remove(&producer_id);
        if let Err(e) = self.engine.close_producer(producer_id) {
            warn!(
                "Session {}: closing producer {} failed: {}",
                self.session_id, producer_id, e
            );
        }
        info!("Session {}: producer {} closed", self.session_id, producer_id);
        Ok(Reply::Ack)
    }

    fn unsubscribe(&mut self, consumer_id: ConsumerId) -> Result<Reply, SignalingError> {
        match self.resources.get(&consumer_id) {
            Some(Resource::Consumer { .. }) => {}
            _ => return Err(unknown("consumer", consumer_id)),
        }
        self.resources.remove(&consumer_id);
        if let Err(e) = self.engine.close_consumer(consumer_id) {
            warn!(
                "Session {}: closing consumer {} failed: {}",
                self.session_id, consumer_id, e
            );
        }
        info!("Session {}: consumer {} closed", self.session_id, consumer_id);
        Ok(Reply::Ack)
    }

    /// React to an engine event; returns notifications for this session's client
    pub fn on_engine_event(&mut self, event: &EngineEvent) -> Vec<Notification> {
        match event {
            EngineEvent::ProducerClosed { producer_id } => {
                // Our own producer may already be gone from the registry
                self.resources.remove(producer_id);

                let orphaned: Vec<ConsumerId> = self
                    .resources
                    .iter()
                    .filter_map(|(id, r)| match r {
                        Resource::Consumer {
                            producer_id: source,
                            ..
                        } if source == producer_id => Some(*id),
                        _ => None,
                    })
                    .collect();

                orphaned
                    .into_iter()
                    .map(|consumer_id| {
                        self.resources.remove(&consumer_id);
                        info!(
                            "Session {}: consumer {} closed with producer {}",
                            self.session_id, consumer_id, producer_id
                        );
                        Notification::ConsumerClosed {
                            consumer_id,
                            producer_id: *producer_id,
                        }
                    })
                    .collect()
            }
            EngineEvent::TransportFailed { transport_id } => {
                if self.transport_state(*transport_id).is_none() {
                    return Vec::new();
                }
                warn!(
                    "Session {}: transport {} lost connectivity",
                    self.session_id, transport_id
                );
                self.close_transport(*transport_id, TransportState::Failed);
                vec![Notification::TransportClosed {
                    transport_id: *transport_id,
                }]
            }
        }
    }

    /// Release a transport and everything on it
    ///
    /// Returns false if the transport was not (or no longer) owned, so the
    /// engine sees at most one close per transport.
    fn close_transport(&mut self, transport_id: TransportId, reason: TransportState) -> bool {
        if self.transport_state(transport_id).is_none() {
            return false;
        }
        self.set_transport_state(transport_id, reason);

        self.resources.retain(|_, r| match r {
            Resource::Producer {
                transport_id: owner,
                ..
            }
            | Resource::Consumer {
                transport_id: owner,
                ..
            } => *owner != transport_id,
            Resource::Transport { .. } => true,
        });
        self.resources.remove(&transport_id);

        if let Err(e) = self.engine.close_transport(transport_id) {
            warn!(
                "Session {}: closing transport {} failed: {}",
                self.session_id, transport_id, e
            );
        }
        info!(
            "Session {}: transport {} released ({})",
            self.session_id, transport_id, reason
        );
        true
    }

    /// Release everything this session owns
    ///
    /// A failing close is logged and does not stop the others.
    pub fn destroy(&mut self) -> usize {
        let transports: Vec<TransportId> = self
            .resources
            .iter()
            .filter(|(_, r)| matches!(r, Resource::Transport { .. }))
            .map(|(id, _)| *id)
            .collect();

        let mut released = 0;
        for transport_id in transports {
            if self.close_transport(transport_id, TransportState::Closed) {
                released += 1;
            }
        }

        // Anything left was not on one of our transports
        for (id, resource) in self.resources.drain() {
            let result = match resource {
                Resource::Producer { .. } => self.engine.close_producer(id),
                Resource::Consumer { .. } => self.engine.close_consumer(id),
                Resource::Transport { .. } => self.engine.close_transport(id),
            };
            if let Err(e) = result {
                warn!("Session {}: releasing {} failed: {}", self.session_id, id, e);
            }
            released += 1;
        }

        info!(
            "Session {} destroyed ({} resources released)",
            self.session_id, released
        );
        released
    }

    /// Drop consumers whose producer the engine no longer has
    ///
    /// Catches up after engine events were missed; returns the notifications
    /// those events would have produced.
    pub fn resync(&mut self) -> Vec<Notification> {
        let orphaned: Vec<(ConsumerId, ProducerId)> = self
            .resources
            .iter()
            .filter_map(|(id, r)| match r {
                Resource::Consumer { producer_id, .. }
                    if self.engine.producer(*producer_id).is_none() =>
                {
                    Some((*id, *producer_id))
                }
                _ => None,
            })
            .collect();

        for (consumer_id, _) in &orphaned {
            self.resources.remove(consumer_id);
            // The engine closed it along with its producer
            let _ = self.engine.close_consumer(*consumer_id);
        }
        if !orphaned.is_empty() {
            warn!(
                "Session {}: {} consumers lost their producer while events were missed",
                self.session_id,
                orphaned.len()
            );
        }

        orphaned
            .into_iter()
            .map(|(consumer_id, producer_id)| Notification::ConsumerClosed {
                consumer_id,
                producer_id,
            })
            .collect()
    }

    /// Await a non-allocating engine call under the request timeout
    async fn bounded<T>(
        &self,
        method: &'static str,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, SignalingError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timed_out(method)),
        }
    }

    /// Await an allocating engine call under the request timeout
    ///
    /// The call runs on its own task. If the bound expires first, whatever it
    /// allocates later is passed to `release`.
    async fn allocate<T, F>(
        &self,
        method: &'static str,
        call: F,
        release: fn(&dyn MediaEngine, &T) -> Result<(), EngineError>,
    ) -> Result<T, SignalingError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let mut task = tokio::spawn(call);
        match tokio::time::timeout(self.request_timeout, &mut task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(SignalingError::Engine(format!("{} aborted: {}", method, e))),
            Err(_) => {
                let engine = self.engine.clone();
                let session_id = self.session_id;
                tokio::spawn(async move {
                    if let Ok(Ok(allocated)) = task.await {
                        match release(engine.as_ref(), &allocated) {
                            Ok(()) => info!(
                                "Session {}: released late result of {}",
                                session_id, method
                            ),
                            Err(e) => warn!(
                                "Session {}: releasing late result of {} failed: {}",
                                session_id, method, e
                            ),
                        }
                    }
                });
                Err(self.timed_out(method))
            }
        }
    }

    fn timed_out(&self, method: &str) -> SignalingError {
        warn!(
            "Session {}: {} timed out after {:?}",
            self.session_id, method, self.request_timeout
        );
        SignalingError::Timeout {
            method: method.to_string(),
            after: self.request_timeout,
        }
    }

    /// State of an owned transport, optionally checking its direction
    fn owned_transport(
        &self,
        transport_id: TransportId,
        direction: Option<TransportDirection>,
    ) -> Result<TransportState, SignalingError> {
        match self.resources.get(&transport_id) {
            Some(Resource::Transport {
                direction: owned,
                state,
            }) if direction.map_or(true, |d| d == *owned) => Ok(*state),
            _ => Err(unknown("transport", transport_id)),
        }
    }

    fn set_transport_state(&mut self, transport_id: TransportId, new_state: TransportState) {
        if let Some(Resource::Transport { state, .. }) = self.resources.get_mut(&transport_id) {
            *state = new_state;
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            self.destroy();
        }
    }
}

fn unknown(what: &str, id: Uuid) -> SignalingError {
    SignalingError::UnknownResource(format!("{} {}", what, id))
}
