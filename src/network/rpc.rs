//! Client side of the signaling connection
//!
//! [`RpcChannel`] turns the WebSocket into request/response calls. Every call
//! gets a fresh correlation id; the reader task routes each response to the
//! call waiting on that id and forwards notifications to a separate queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::error::SignalingError;
use crate::config::ClientConfig;
use crate::protocol::{
    ConsumeOutcome, ConsumerId, DtlsParameters, Frame, MediaKind, Notification, ProducerId,
    Reply, Request, RpcFailure, RtpCapabilities, RtpParameters, TransportConnectionParams,
    TransportDirection, TransportId,
};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Reply, RpcFailure>>>;
type PendingReply = oneshot::Receiver<Result<Reply, RpcFailure>>;

/// Connects to a signaling server
pub struct SignalingClient {
    config: ClientConfig,
}

impl SignalingClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Open the WebSocket and start the reader and writer tasks
    pub async fn connect(&self) -> Result<RpcChannel, SignalingError> {
        let (ws_stream, _) = connect_async(self.config.server_url.as_str()).await?;
        debug!("Connected to signaling server: {}", self.config.server_url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    warn!("Signaling send failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                            Ok(Frame::Response { id, result }) => {
                                let waiter = pending.lock().remove(&id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(result);
                                    }
                                    None => debug!("Dropping response to unknown call #{}", id),
                                }
                            }
                            Ok(Frame::Notification { notification }) => {
                                debug!("Notification: {:?}", notification);
                                let _ = notification_tx.send(notification);
                            }
                            Ok(Frame::Request { id, .. }) => {
                                warn!("Ignoring request #{} from server", id);
                            }
                            Err(e) => warn!("Invalid message from server: {}", e),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("Signaling receive failed: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                closed.store(true, Ordering::SeqCst);
                // Dropping the senders fails every call still in flight
                let abandoned = {
                    let mut pending = pending.lock();
                    let n = pending.len();
                    pending.clear();
                    n
                };
                if abandoned > 0 {
                    warn!("Signaling connection closed with {} calls pending", abandoned);
                }
                info!("Signaling connection closed");
            })
        };

        Ok(RpcChannel {
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: self.config.request_timeout,
            closed,
            notifications: Mutex::new(Some(notification_rx)),
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

/// Removes a call's pending entry however the call ends
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Request/response calls over one signaling connection
pub struct RpcChannel {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcChannel {
    /// Issue one request and wait for its response
    ///
    /// Fails with `Timeout` if no response arrives in time and with
    /// `ConnectionClosed` if the connection ends first.
    pub async fn request(&self, request: Request) -> Result<Reply, SignalingError> {
        let method = request.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_guard, rx) = self.register(id)?;

        let json = Frame::Request { id, request }.to_json()?;
        if self.outbound.send(Message::Text(json)).is_err() {
            return Err(SignalingError::ConnectionClosed);
        }
        debug!("-> {} #{}", method, id);

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(reply))) => {
                debug!("<- {} #{} ok", method, id);
                Ok(reply)
            }
            Ok(Ok(Err(failure))) => {
                warn!("<- {} #{} failed: {}", method, id, failure);
                Err(SignalingError::from_failure(method, failure))
            }
            Ok(Err(_)) => Err(SignalingError::ConnectionClosed),
            Err(_) => {
                warn!("{} #{} timed out", method, id);
                Err(SignalingError::Timeout {
                    method: method.to_string(),
                    after: self.request_timeout,
                })
            }
        }
    }

    /// Add the pending entry for call `id`
    ///
    /// The closed flag is checked after the insert: the reader sets it before
    /// clearing the map, so an entry that missed the clear is caught here.
    fn register(&self, id: u64) -> Result<(PendingGuard<'_>, PendingReply), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        if self.is_closed() {
            return Err(SignalingError::ConnectionClosed);
        }
        Ok((guard, rx))
    }

    /// Take the notification queue; only the first caller gets it
    ///
    /// The queue ends when the connection closes.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close the connection and fail all pending calls
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));
        self.pending.lock().clear();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            // The reader only ends once the server answers the close
            if tokio::time::timeout(Duration::from_millis(500), &mut task)
                .await
                .is_err()
            {
                debug!("Signaling task did not stop in time");
                task.abort();
            }
        }
    }

    pub async fn get_router_rtp_capabilities(&self) -> Result<RtpCapabilities, SignalingError> {
        match self.request(Request::GetRouterRtpCapabilities).await? {
            Reply::RtpCapabilities(caps) => Ok(caps),
            _ => Err(unexpected(&Request::GetRouterRtpCapabilities)),
        }
    }

    pub async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportConnectionParams, SignalingError> {
        let request = match direction {
            TransportDirection::Send => Request::CreateProducerTransport,
            TransportDirection::Recv => Request::CreateConsumerTransport,
        };
        let method = request.method();
        match self.request(request).await? {
            Reply::TransportCreated(params) => Ok(params),
            _ => Err(SignalingError::UnexpectedReply {
                method: method.to_string(),
            }),
        }
    }

    pub async fn connect_transport(
        &self,
        direction: TransportDirection,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalingError> {
        let request = match direction {
            TransportDirection::Send => Request::ConnectProducerTransport {
                transport_id,
                dtls_parameters,
            },
            TransportDirection::Recv => Request::ConnectConsumerTransport {
                transport_id,
                dtls_parameters,
            },
        };
        self.ack(request).await
    }

    pub async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SignalingError> {
        let reply = self
            .request(Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
            })
            .await?;
        match reply {
            Reply::Produced { producer_id } => Ok(producer_id),
            _ => Err(SignalingError::UnexpectedReply {
                method: "produce".to_string(),
            }),
        }
    }

    pub async fn consume(
        &self,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
        producer_id: Option<ProducerId>,
    ) -> Result<ConsumeOutcome, SignalingError> {
        let reply = self
            .request(Request::Consume {
                transport_id,
                rtp_capabilities,
                producer_id,
            })
            .await?;
        match reply {
            Reply::Consumed(outcome) => Ok(outcome),
            _ => Err(SignalingError::UnexpectedReply {
                method: "consume".to_string(),
            }),
        }
    }

    pub async fn resume(&self, consumer_id: ConsumerId) -> Result<(), SignalingError> {
        self.ack(Request::Resume { consumer_id }).await
    }

    pub async fn unpublish(&self, producer_id: ProducerId) -> Result<(), SignalingError> {
        self.ack(Request::Unpublish { producer_id }).await
    }

    pub async fn unsubscribe(&self, consumer_id: ConsumerId) -> Result<(), SignalingError> {
        self.ack(Request::Unsubscribe { consumer_id }).await
    }

    pub async fn close_transport(&self, transport_id: TransportId) -> Result<(), SignalingError> {
        self.ack(Request::CloseTransport { transport_id }).await
    }

    async fn ack(&self, request: Request) -> Result<(), SignalingError> {
        let method = request.method();
        match self.request(request).await? {
            Reply::Ack => Ok(()),
            _ => Err(SignalingError::UnexpectedReply {
                method: method.to_string(),
            }),
        }
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn unexpected(request: &Request) -> SignalingError {
    SignalingError::UnexpectedReply {
        method: request.method().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Accepts one connection and reads requests without ever answering
    async fn silent_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        (format!("ws://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_request_times_out_and_clears_pending() {
        let (url, _server) = silent_server().await;
        let config = ClientConfig {
            server_url: url,
            request_timeout: Duration::from_millis(100),
        };
        let channel = SignalingClient::new(config).connect().await.unwrap();

        let result = channel.get_router_rtp_capabilities().await;
        assert!(matches!(result, Err(SignalingError::Timeout { .. })));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_registered_after_shutdown_fails_at_once() {
        let (url, _server) = silent_server().await;
        let config = ClientConfig {
            server_url: url,
            request_timeout: Duration::from_secs(5),
        };
        let channel = SignalingClient::new(config).connect().await.unwrap();

        // What the reader does when the connection ends
        channel.closed.store(true, Ordering::SeqCst);

        let started = std::time::Instant::now();
        let result = channel.get_router_rtp_capabilities().await;
        assert!(matches!(result, Err(SignalingError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (url, _server) = silent_server().await;
        let config = ClientConfig {
            server_url: url,
            request_timeout: Duration::from_secs(5),
        };
        let channel = Arc::new(SignalingClient::new(config).connect().await.unwrap());

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.get_router_rtp_capabilities().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.pending_calls(), 1);

        channel.close().await;

        let result = call.await.unwrap();
        assert!(matches!(result, Err(SignalingError::ConnectionClosed)));
        assert!(matches!(
            channel.resume(uuid::Uuid::new_v4()).await,
            Err(SignalingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_server_going_away_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Read the first request, then hang up
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let config = ClientConfig::new(&format!("ws://{}", addr));
        let channel = SignalingClient::new(config).connect().await.unwrap();
        let mut notifications = channel.take_notifications().unwrap();

        let result = channel.get_router_rtp_capabilities().await;
        assert!(matches!(result, Err(SignalingError::ConnectionClosed)));
        assert!(notifications.recv().await.is_none());
        assert!(channel.is_closed());
    }
}
