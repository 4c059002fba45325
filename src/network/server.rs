//! WebSocket signaling server
//!
//! Each accepted connection gets its own task and its own
//! [`SessionCoordinator`]. Requests on a connection are handled one at a
//! time, in arrival order; engine events are relayed as notifications in
//! between.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coordinator::SessionCoordinator;
use super::error::SignalingError;
use crate::config::ServerConfig;
use crate::engine::MediaEngine;
use crate::protocol::{ErrorCode, Frame, Request, RpcFailure};

/// Signaling server over a shared media engine
pub struct SignalingServer {
    engine: Arc<dyn MediaEngine>,
    request_timeout: Duration,
}

impl SignalingServer {
    pub fn new(engine: Arc<dyn MediaEngine>, config: &ServerConfig) -> Self {
        Self {
            engine,
            request_timeout: config.request_timeout(),
        }
    }

    /// Serve plain WebSocket connections on `addr`
    pub async fn run(&self, addr: &str) -> Result<(), SignalingError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on ws://{}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New signaling connection from {}", peer_addr);
                    let engine = self.engine.clone();
                    let request_timeout = self.request_timeout;
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws_stream) => {
                                if let Err(e) =
                                    handle_connection(ws_stream, engine, request_timeout).await
                                {
                                    warn!("Connection error: {}", e);
                                }
                            }
                            Err(e) => warn!("WebSocket handshake failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Serve WebSocket connections over TLS on `addr`
    pub async fn run_tls(&self, addr: &str, acceptor: TlsAcceptor) -> Result<(), SignalingError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on wss://{}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New TLS connection from {}", peer_addr);
                    let acceptor = acceptor.clone();
                    let engine = self.engine.clone();
                    let request_timeout = self.request_timeout;
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("TLS handshake failed from {}: {}", peer_addr, e);
                                return;
                            }
                        };
                        match accept_async(tls_stream).await {
                            Ok(ws_stream) => {
                                if let Err(e) =
                                    handle_connection(ws_stream, engine, request_timeout).await
                                {
                                    warn!("Connection error: {}", e);
                                }
                            }
                            Err(e) => warn!("WebSocket handshake failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Drive one connection until the peer goes away, then destroy its session
async fn handle_connection<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    engine: Arc<dyn MediaEngine>,
    request_timeout: Duration,
) -> Result<(), SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let session_id = Uuid::new_v4();
    let mut coordinator =
        SessionCoordinator::new(session_id, engine.clone()).with_request_timeout(request_timeout);
    let mut events = engine.subscribe();
    let mut result = Ok(());

    info!("Session {} opened", session_id);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match Frame::from_json(&text) {
                            Ok(Frame::Request { id, request }) => {
                                Some(dispatch(&mut coordinator, id, request).await)
                            }
                            Ok(other) => {
                                warn!("Session {}: ignoring unexpected frame {:?}", session_id, other);
                                None
                            }
                            Err(e) => {
                                warn!("Session {}: invalid message: {}", session_id, e);
                                malformed_request_reply(&text, &e)
                            }
                        };

                        if let Some(frame) = reply {
                            if let Err(e) = send_frame(&mut write, &frame).await {
                                result = Err(e);
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        result = Err(e.into());
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                let notifications = match event {
                    Ok(event) => coordinator.on_engine_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session {}: missed {} engine events", session_id, skipped);
                        coordinator.resync()
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Session {}: media engine went away", session_id);
                        break;
                    }
                };
                for notification in notifications {
                    debug!("Session {}: notifying {:?}", session_id, notification);
                    let frame = Frame::Notification { notification };
                    if let Err(e) = send_frame(&mut write, &frame).await {
                        result = Err(e);
                        break;
                    }
                }
                if result.is_err() {
                    break;
                }
            }
        }
    }

    coordinator.destroy();
    info!("Session {} closed", session_id);
    result
}

/// Run one request handler to completion and build its response
///
/// The coordinator bounds its own engine calls; the handler is never
/// cancelled from here.
async fn dispatch(coordinator: &mut SessionCoordinator, id: u64, request: Request) -> Frame {
    let method = request.method();
    let session_id = coordinator.session_id();

    let result = coordinator.handle(request).await;

    match &result {
        Ok(_) => info!("Session {}: {} #{} ok", session_id, method, id),
        Err(e) => warn!("Session {}: {} #{} failed: {}", session_id, method, id, e),
    }

    Frame::Response {
        id,
        result: result.map_err(|e| e.to_failure()),
    }
}

/// Answer a request whose body did not parse, if its id can be recovered
fn malformed_request_reply(text: &str, err: &serde_json::Error) -> Option<Frame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "request" {
        return None;
    }
    let id = value.get("id")?.as_u64()?;
    Some(Frame::Response {
        id,
        result: Err(RpcFailure::new(ErrorCode::BadRequest, err.to_string())),
    })
}

async fn send_frame<W>(write: &mut W, frame: &Frame) -> Result<(), SignalingError>
where
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = frame.to_json()?;
    write.send(Message::Text(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_request_gets_bad_request() {
        let text = r#"{"type":"request","id":12,"request":{"method":"produce","params":{}}}"#;
        let err = Frame::from_json(text).unwrap_err();
        match malformed_request_reply(text, &err) {
            Some(Frame::Response { id, result }) => {
                assert_eq!(id, 12);
                assert_eq!(result.unwrap_err().code, ErrorCode::BadRequest);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_gets_no_reply() {
        let text = "not json";
        let err = Frame::from_json(text).unwrap_err();
        assert!(malformed_request_reply(text, &err).is_none());
    }
}
