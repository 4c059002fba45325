//! Client session
//!
//! Ties the signaling connection, capability negotiation and the two media
//! paths (publication and subscription) together behind the state machine
//! in [`super::state`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::media_stack::{MediaStackEvent, PeerMediaStack};
use super::negotiator::NegotiatedCapabilities;
use super::sequencer::{release_remote, TransportSequencer};
use super::state::{ConnectionState, SessionState, StateCallback, StateChange};
use crate::config::ClientConfig;
use crate::network::{RpcChannel, SignalingClient, SignalingError};
use crate::protocol::{
    ConsumeOutcome, ConsumerId, ConsumerParams, MediaKind, Notification, ProducerId,
    TransportDirection, TransportId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaPath {
    Publication,
    Subscription,
}

impl MediaPath {
    fn change(self, state: ConnectionState) -> StateChange {
        match self {
            MediaPath::Publication => StateChange::Publication(state),
            MediaPath::Subscription => StateChange::Subscription(state),
        }
    }
}

/// A live media path: its transport and the producer or consumer on it
struct ActivePath {
    transport_id: TransportId,
    /// Producer id for the publication, consumer id for the subscription
    resource_id: uuid::Uuid,
    watcher: Option<JoinHandle<()>>,
}

impl ActivePath {
    fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// State shared with the background watchers
struct Shared {
    state: Mutex<SessionState>,
    callback: Mutex<Option<Arc<StateCallback>>>,
    publication: Mutex<Option<ActivePath>>,
    subscription: Mutex<Option<ActivePath>>,
}

impl Shared {
    fn snapshot(&self) -> SessionState {
        *self.state.lock()
    }

    /// Apply and report a transition; repeated values are not reported
    fn transition(&self, change: StateChange) {
        let mut state = self.state.lock();
        if !state.apply(change) {
            return;
        }
        debug!("State {}", change);
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(change);
        }
    }

    fn slot(&self, path: MediaPath) -> &Mutex<Option<ActivePath>> {
        match path {
            MediaPath::Publication => &self.publication,
            MediaPath::Subscription => &self.subscription,
        }
    }

    /// Remove the active path if `pred` holds for it
    fn take_if(&self, path: MediaPath, pred: impl Fn(&ActivePath) -> bool) -> Option<ActivePath> {
        let mut slot = self.slot(path).lock();
        if slot.as_ref().map_or(false, pred) {
            slot.take()
        } else {
            None
        }
    }

    /// Drop a path whose media is gone: local release and a state change
    fn end_path(
        &self,
        path: MediaPath,
        mut active: ActivePath,
        stack: &dyn PeerMediaStack,
        state: ConnectionState,
    ) -> TransportId {
        active.stop_watching();
        stack.close_transport(active.transport_id);
        self.transition(path.change(state));
        active.transport_id
    }
}

/// One client's session with the SFU
pub struct ClientSession {
    config: ClientConfig,
    stack: Arc<dyn PeerMediaStack>,
    shared: Arc<Shared>,
    channel: Option<Arc<RpcChannel>>,
    capabilities: Option<NegotiatedCapabilities>,
    event_task: Option<JoinHandle<()>>,
}

impl ClientSession {
    pub fn new(config: ClientConfig, stack: Arc<dyn PeerMediaStack>) -> Self {
        Self {
            config,
            stack,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::default()),
                callback: Mutex::new(None),
                publication: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
            channel: None,
            capabilities: None,
            event_task: None,
        }
    }

    /// Set the observer for state transitions
    ///
    /// It is called once per transition, in order, possibly from a
    /// background task. It must not call back into the session.
    pub fn set_state_callback<F>(&mut self, callback: F)
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        *self.shared.callback.lock() = Some(Arc::new(Box::new(callback)));
    }

    pub fn state(&self) -> SessionState {
        self.shared.snapshot()
    }

    /// Negotiated capabilities; `NotReady` before `connect` completed
    pub fn capabilities(&self) -> Result<&NegotiatedCapabilities, SignalingError> {
        self.capabilities
            .as_ref()
            .ok_or_else(|| SignalingError::NotReady("capabilities not negotiated".to_string()))
    }

    pub fn producer_id(&self) -> Option<ProducerId> {
        self.shared.publication.lock().as_ref().map(|p| p.resource_id)
    }

    pub fn consumer_id(&self) -> Option<ConsumerId> {
        self.shared.subscription.lock().as_ref().map(|s| s.resource_id)
    }

    /// Connect to the server and negotiate capabilities
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        let state = self.shared.snapshot();
        state.check(state.can_connect(), "connect")?;

        // Leftovers of a connection that failed
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.capabilities = None;

        self.shared
            .transition(StateChange::Connection(ConnectionState::Connecting));

        let client = SignalingClient::new(self.config.clone());
        let result = async {
            let channel = client.connect().await?;
            match NegotiatedCapabilities::negotiate(&channel, self.stack.as_ref()).await {
                Ok(capabilities) => Ok((channel, capabilities)),
                Err(e) => {
                    channel.close().await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok((channel, capabilities)) => {
                let channel = Arc::new(channel);
                if let Some(notifications) = channel.take_notifications() {
                    self.event_task = Some(tokio::spawn(run_events(
                        self.shared.clone(),
                        channel.clone(),
                        self.stack.clone(),
                        notifications,
                    )));
                }
                self.channel = Some(channel);
                self.capabilities = Some(capabilities);
                info!("Connected to {}", self.config.server_url);
                self.shared
                    .transition(StateChange::Connection(ConnectionState::Connected));
                Ok(())
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", self.config.server_url, e);
                self.shared
                    .transition(StateChange::Connection(ConnectionState::Failed));
                Err(e)
            }
        }
    }

    /// Publish a track of `kind`
    pub async fn publish(&mut self, kind: MediaKind) -> Result<ProducerId, SignalingError> {
        let state = self.shared.snapshot();
        state.check(state.can_publish(), "publish")?;
        let channel = self.channel()?;
        if !self.capabilities()?.can_produce(kind) {
            return Err(SignalingError::BadRequest(format!(
                "{} is not supported by both router and device",
                kind
            )));
        }

        self.shared
            .transition(StateChange::Publication(ConnectionState::Connecting));

        let stack = self.stack.as_ref();
        let result = async {
            let mut transport =
                TransportSequencer::open(&channel, stack, TransportDirection::Send).await?;
            let produced = async {
                transport.connect(&channel).await?;
                transport.wait_connected(self.config.request_timeout).await?;
                let rtp_parameters = stack.send_parameters(transport.id(), kind).await?;
                channel.produce(transport.id(), kind, rtp_parameters).await
            }
            .await;
            match produced {
                Ok(producer_id) => Ok((transport, producer_id)),
                Err(e) => {
                    transport.close(&channel, stack).await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok((mut transport, producer_id)) => {
                self.activate(MediaPath::Publication, &channel, &mut transport, producer_id);
                info!("Publishing {} as {}", kind, producer_id);
                self.shared
                    .transition(StateChange::Publication(ConnectionState::Connected));
                Ok(producer_id)
            }
            Err(e) => {
                warn!("Publish failed: {}", e);
                self.shared
                    .transition(StateChange::Publication(ConnectionState::Failed));
                Err(e)
            }
        }
    }

    /// Subscribe to a producer, or to the latest one when `producer_id` is None
    ///
    /// `Unavailable` is not an error and leaves the subscription state as it
    /// was.
    pub async fn subscribe(
        &mut self,
        producer_id: Option<ProducerId>,
    ) -> Result<ConsumeOutcome, SignalingError> {
        let state = self.shared.snapshot();
        state.check(state.can_subscribe(), "subscribe")?;
        let channel = self.channel()?;
        let rtp_capabilities = self.capabilities()?.local().clone();
        let stack = self.stack.as_ref();

        let params = match channel.create_transport(TransportDirection::Recv).await {
            Ok(params) => params,
            Err(e) => return Err(self.subscription_failed(e)),
        };
        let transport_id = params.id;

        let consumer = match channel
            .consume(transport_id, rtp_capabilities, producer_id)
            .await
        {
            Ok(ConsumeOutcome::Consumer(consumer)) => consumer,
            Ok(ConsumeOutcome::Unavailable { reason }) => {
                info!("Nothing to consume: {}", reason);
                release_remote(&channel, transport_id).await;
                return Ok(ConsumeOutcome::Unavailable { reason });
            }
            Err(e) => {
                release_remote(&channel, transport_id).await;
                return Err(self.subscription_failed(e));
            }
        };

        self.shared
            .transition(StateChange::Subscription(ConnectionState::Connecting));

        let result = async {
            let mut transport =
                TransportSequencer::build(&channel, stack, TransportDirection::Recv, params)
                    .await?;
            match receive(&channel, stack, &mut transport, &consumer, &self.config).await {
                Ok(()) => Ok(transport),
                Err(e) => {
                    transport.close(&channel, stack).await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok(mut transport) => {
                self.activate(MediaPath::Subscription, &channel, &mut transport, consumer.id);
                info!("Consuming {} as {}", consumer.producer_id, consumer.id);
                self.shared
                    .transition(StateChange::Subscription(ConnectionState::Connected));
                Ok(ConsumeOutcome::Consumer(consumer))
            }
            Err(e) => Err(self.subscription_failed(e)),
        }
    }

    /// Stop publishing; local resources go first, then the server confirms
    pub async fn unpublish(&mut self) -> Result<(), SignalingError> {
        let state = self.shared.snapshot();
        state.check(state.can_unpublish(), "unpublish")?;
        let channel = self.channel()?;

        let Some(mut active) = self.shared.publication.lock().take() else {
            return Err(SignalingError::InvalidState("nothing published".to_string()));
        };
        active.stop_watching();
        self.stack.close_transport(active.transport_id);

        let confirmed = async {
            already_gone_is_ok(channel.unpublish(active.resource_id).await)?;
            already_gone_is_ok(channel.close_transport(active.transport_id).await)
        }
        .await;

        self.confirm(MediaPath::Publication, confirmed)
    }

    /// Stop consuming; local resources go first, then the server confirms
    pub async fn unsubscribe(&mut self) -> Result<(), SignalingError> {
        let state = self.shared.snapshot();
        state.check(state.can_unsubscribe(), "unsubscribe")?;
        let channel = self.channel()?;

        let Some(mut active) = self.shared.subscription.lock().take() else {
            return Err(SignalingError::InvalidState("nothing subscribed".to_string()));
        };
        active.stop_watching();
        self.stack.close_transport(active.transport_id);

        let confirmed = async {
            already_gone_is_ok(channel.unsubscribe(active.resource_id).await)?;
            already_gone_is_ok(channel.close_transport(active.transport_id).await)
        }
        .await;

        self.confirm(MediaPath::Subscription, confirmed)
    }

    /// Close everything; the server releases this session's resources
    pub async fn disconnect(&mut self) -> Result<(), SignalingError> {
        let state = self.shared.snapshot();
        state.check(state.can_disconnect(), "disconnect")?;

        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        for path in [MediaPath::Publication, MediaPath::Subscription] {
            let taken = self.shared.slot(path).lock().take();
            if let Some(active) = taken {
                self.shared.end_path(
                    path,
                    active,
                    self.stack.as_ref(),
                    ConnectionState::Disconnected,
                );
            }
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.capabilities = None;

        self.shared
            .transition(StateChange::Publication(ConnectionState::Disconnected));
        self.shared
            .transition(StateChange::Subscription(ConnectionState::Disconnected));
        self.shared
            .transition(StateChange::Connection(ConnectionState::Disconnected));
        info!("Disconnected from {}", self.config.server_url);
        Ok(())
    }

    fn channel(&self) -> Result<Arc<RpcChannel>, SignalingError> {
        self.channel
            .clone()
            .ok_or_else(|| SignalingError::InvalidState("not connected".to_string()))
    }

    /// Record a connected path and start watching its connectivity
    fn activate(
        &self,
        path: MediaPath,
        channel: &Arc<RpcChannel>,
        transport: &mut TransportSequencer,
        resource_id: uuid::Uuid,
    ) {
        let watcher = transport.take_events().map(|events| {
            tokio::spawn(watch_transport(
                self.shared.clone(),
                channel.clone(),
                self.stack.clone(),
                path,
                transport.id(),
                events,
            ))
        });
        *self.shared.slot(path).lock() = Some(ActivePath {
            transport_id: transport.id(),
            resource_id,
            watcher,
        });
    }

    fn subscription_failed(&self, e: SignalingError) -> SignalingError {
        warn!("Subscribe failed: {}", e);
        self.shared
            .transition(StateChange::Subscription(ConnectionState::Failed));
        e
    }

    fn confirm(
        &self,
        path: MediaPath,
        confirmed: Result<(), SignalingError>,
    ) -> Result<(), SignalingError> {
        match confirmed {
            Ok(()) => {
                self.shared
                    .transition(path.change(ConnectionState::Disconnected));
                Ok(())
            }
            Err(e) => {
                warn!("{:?} teardown not confirmed: {}", path, e);
                self.shared.transition(path.change(ConnectionState::Failed));
                Err(e)
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        for path in [MediaPath::Publication, MediaPath::Subscription] {
            let taken = self.shared.slot(path).lock().take();
            if let Some(mut active) = taken {
                active.stop_watching();
                self.stack.close_transport(active.transport_id);
            }
        }
    }
}

/// Connect a receive transport and start the consumer flowing
async fn receive(
    channel: &RpcChannel,
    stack: &dyn PeerMediaStack,
    transport: &mut TransportSequencer,
    consumer: &ConsumerParams,
    config: &ClientConfig,
) -> Result<(), SignalingError> {
    transport.connect(channel).await?;
    stack.receive(transport.id(), consumer).await?;
    transport.wait_connected(config.request_timeout).await?;
    channel.resume(consumer.id).await
}

fn already_gone_is_ok(result: Result<(), SignalingError>) -> Result<(), SignalingError> {
    match result {
        Err(SignalingError::UnknownResource(_)) => Ok(()),
        other => other,
    }
}

/// Watch a connected transport; connectivity loss fails its media path
async fn watch_transport(
    shared: Arc<Shared>,
    channel: Arc<RpcChannel>,
    stack: Arc<dyn PeerMediaStack>,
    path: MediaPath,
    transport_id: TransportId,
    mut events: mpsc::UnboundedReceiver<MediaStackEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            MediaStackEvent::Connected => {}
            MediaStackEvent::Failed => {
                warn!("{:?} transport {} lost connectivity", path, transport_id);
                let Some(mut active) =
                    shared.take_if(path, |active| active.transport_id == transport_id)
                else {
                    return;
                };
                // This task is the watcher; it must not abort itself
                active.watcher = None;
                shared.end_path(path, active, stack.as_ref(), ConnectionState::Failed);
                release_remote(&channel, transport_id).await;
                return;
            }
            MediaStackEvent::Closed => return,
        }
    }
}

/// Handle server notifications until the connection ends
async fn run_events(
    shared: Arc<Shared>,
    channel: Arc<RpcChannel>,
    stack: Arc<dyn PeerMediaStack>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::ConsumerClosed {
                consumer_id,
                producer_id,
            } => {
                if let Some(active) = shared.take_if(MediaPath::Subscription, |active| {
                    active.resource_id == consumer_id
                }) {
                    info!("Producer {} went away, subscription ended", producer_id);
                    let transport_id = shared.end_path(
                        MediaPath::Subscription,
                        active,
                        stack.as_ref(),
                        ConnectionState::Disconnected,
                    );
                    release_remote(&channel, transport_id).await;
                }
            }
            Notification::TransportClosed { transport_id } => {
                for path in [MediaPath::Publication, MediaPath::Subscription] {
                    if let Some(active) =
                        shared.take_if(path, |active| active.transport_id == transport_id)
                    {
                        warn!("Server closed {:?} transport {}", path, transport_id);
                        shared.end_path(path, active, stack.as_ref(), ConnectionState::Failed);
                    }
                }
            }
        }
    }

    warn!("Signaling connection lost");
    for path in [MediaPath::Publication, MediaPath::Subscription] {
        let taken = shared.slot(path).lock().take();
        if let Some(active) = taken {
            shared.end_path(path, active, stack.as_ref(), ConnectionState::Failed);
        }
    }
    shared.transition(StateChange::Connection(ConnectionState::Failed));
}
