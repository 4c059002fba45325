//! E2E tests for the signaling RPC surface
//!
//! Tests the request flow against a real server: capabilities → transports →
//! produce → consume → resume, plus ownership and state errors, producer
//! closure notifications and resource release on disconnect.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use common::{client_dtls, eventually, send_parameters_for, server_url, start_test_server};
use sfu_signal::config::ClientConfig;
use sfu_signal::network::{RpcChannel, SignalingClient, SignalingError};
use sfu_signal::protocol::{
    ConsumeOutcome, ErrorCode, Frame, MediaKind, Notification, ProducerId, RtpCapabilities,
    TransportDirection, TransportId,
};

async fn connect(port: u16) -> RpcChannel {
    SignalingClient::new(ClientConfig::new(&server_url(port)))
        .connect()
        .await
        .expect("Failed to connect")
}

/// Create, connect and produce on a send transport
async fn publish(channel: &RpcChannel, kind: MediaKind) -> (TransportId, ProducerId) {
    let caps = channel.get_router_rtp_capabilities().await.unwrap();
    let transport = channel
        .create_transport(TransportDirection::Send)
        .await
        .unwrap();
    channel
        .connect_transport(TransportDirection::Send, transport.id, client_dtls())
        .await
        .unwrap();
    let producer_id = channel
        .produce(
            transport.id,
            kind,
            send_parameters_for(&caps, kind).unwrap(),
        )
        .await
        .unwrap();
    (transport.id, producer_id)
}

/// Test: Router capabilities
/// Given a running server
/// When a client asks for router capabilities
/// Then it gets the configured opus and VP8 codecs
#[tokio::test]
async fn test_get_router_capabilities() {
    let port = common::find_available_port();
    let (_engine, server_handle) = start_test_server(port).await;

    let channel = connect(port).await;
    let caps = channel.get_router_rtp_capabilities().await;

    channel.close().await;
    server_handle.abort();

    let caps = caps.expect("Should get capabilities");
    assert!(caps.supports_kind(MediaKind::Audio));
    assert!(caps.supports_kind(MediaKind::Video));
    assert!(caps.find_codec("audio/opus", 48_000).is_some());
}

/// Test: Connect on a transport the session does not own
/// Given a connected client
/// When it connects a transport id it never created
/// Then the call fails with UnknownResource
#[tokio::test]
async fn test_connect_unknown_transport() {
    let port = common::find_available_port();
    let (_engine, server_handle) = start_test_server(port).await;

    let channel = connect(port).await;
    let result = channel
        .connect_transport(TransportDirection::Send, Uuid::new_v4(), client_dtls())
        .await;

    channel.close().await;
    server_handle.abort();

    assert!(matches!(result, Err(SignalingError::UnknownResource(_))));
}

/// Test: Transports are scoped to their session
/// Given a transport created by one client
/// When another client tries to connect it
/// Then the call fails with UnknownResource
#[tokio::test]
async fn test_transport_of_other_session_is_unknown() {
    let port = common::find_available_port();
    let (_engine, server_handle) = start_test_server(port).await;

    let owner = connect(port).await;
    let other = connect(port).await;
    let transport = owner
        .create_transport(TransportDirection::Send)
        .await
        .unwrap();
    let result = other
        .connect_transport(TransportDirection::Send, transport.id, client_dtls())
        .await;

    owner.close().await;
    other.close().await;
    server_handle.abort();

    assert!(matches!(result, Err(SignalingError::UnknownResource(_))));
}

/// Test: Produce before connect
/// Given a created but unconnected send transport
/// When the client produces on it
/// Then the call fails with InvalidState
#[tokio::test]
async fn test_produce_before_connect() {
    let port = common::find_available_port();
    let (_engine, server_handle) = start_test_server(port).await;

    let channel = connect(port).await;
    let caps = channel.get_router_rtp_capabilities().await.unwrap();
    let transport = channel
        .create_transport(TransportDirection::Send)
        .await
        .unwrap();
    let result = channel
        .produce(
            transport.id,
            MediaKind::Video,
            send_parameters_for(&caps, MediaKind::Video).unwrap(),
        )
        .await;

    channel.close().await;
    server_handle.abort();

    assert!(matches!(result, Err(SignalingError::InvalidState(_))));
}

/// Test: Connect is accepted once
/// Given a connected send transport
/// When connect is issued again
/// Then the second call fails with InvalidState
#[tokio::test]
async fn test_second_connect_is_rejected() {
    let port = common::find_available_port();
    let (_engine, server_handle) = start_test_server(port).await;

    let channel = connect(port).await;
    let transport = channel
        .create_transport(TransportDirection::Send)
        .await
        .unwrap();
    channel
        .connect_transport(TransportDirection::Send, transport.id, client_dtls())
        .await
        .unwrap();
    let again = channel
        .connect_transport(TransportDirection::Send, transport.id, client_dtls())
        .await;

    channel.close().await;
    server_handle.abort();

    assert!(matches!(again, Err(SignalingError::InvalidState(_))));
}

/// Test: Publish then consume from another client
/// Given a client producing video
/// When a second client consumes it and resumes
/// Then the consumer starts paused, references the producer and resumes
#[tokio::test]
async fn test_publish_and_consume() {
    let port = common::find_available_port();
    let (engine, server_handle) = start_test_server(port).await;

    let publisher = connect(port).await;
    let (_, producer_id) = publish(&publisher, MediaKind::Video).await;

    let subscriber = connect(port).await;
    let caps = subscriber.get_router_rtp_capabilities().await.unwrap();
    let recv = subscriber
        .create_transport(TransportDirection::Recv)
        .await
        .unwrap();
    let outcome = subscriber
        .consume(recv.id, caps, Some(producer_id))
        .await
        .unwrap();

    let consumer = match outcome {
        ConsumeOutcome::Consumer(consumer) => consumer,
        other => panic!("Expected consumer, got {:?}", other),
    };
    assert_eq!(consumer.producer_id, producer_id);
    assert_eq!(consumer.kind, MediaKind::Video);
    assert!(!consumer.producer_paused);
    assert_eq!(engine.is_consumer_paused(consumer.id), Some(true));

    subscriber
        .connect_transport(TransportDirection::Recv, recv.id, client_dtls())
        .await
        .unwrap();
    subscriber.resume(consumer.id).await.unwrap();
    assert_eq!(engine.is_consumer_paused(consumer.id), Some(false));

    publisher.close().await;
    subscriber.close().await;
    server_handle.abort();
}

/// Test: Consume with incompatible capabilities
/// Given a client producing video
/// When a second client consumes with audio-only capabilities
/// Then it gets Unavailable rather than an error and no consumer exists
#[tokio::test]
async fn test_consume_incompatible_is_unavailable() {
    let port = common::find_available_port();
    let (engine, server_handle) = start_test_server(port).await;

    let publisher = connect(port).await;
    let (_, producer_id) = publish(&publisher, MediaKind::Video).await;

    let subscriber = connect(port).await;
    let router = subscriber.get_router_rtp_capabilities().await.unwrap();
    let audio_only = RtpCapabilities {
        codecs: router
            .codecs
            .into_iter()
            .filter(|c| c.kind == MediaKind::Audio)
            .collect(),
        header_extensions: Vec::new(),
    };
    let recv = subscriber
        .create_transport(TransportDirection::Recv)
        .await
        .unwrap();
    let outcome = subscriber
        .consume(recv.id, audio_only, Some(producer_id))
        .await
        .unwrap();

    assert!(outcome.is_unavailable(), "got {:?}", outcome);
    assert_eq!(engine.consumer_count(), 0);

    publisher.close().await;
    subscriber.close().await;
    server_handle.abort();
}

/// Test: Producer closure reaches consumers in other sessions
/// Given a consumer of another client's producer
/// When the producer is unpublished
/// Then the consumer's client is notified with consumerClosed
#[tokio::test]
async fn test_unpublish_notifies_consumer() {
    let port = common::find_available_port();
    let (engine, server_handle) = start_test_server(port).await;

    let publisher = connect(port).await;
    let (_, producer_id) = publish(&publisher, MediaKind::Audio).await;

    let subscriber = connect(port).await;
    let mut notifications = subscriber.take_notifications().unwrap();
    let caps = subscriber.get_router_rtp_capabilities().await.unwrap();
    let recv = subscriber
        .create_transport(TransportDirection::Recv)
        .await
        .unwrap();
    let consumer_id = match subscriber.consume(recv.id, caps, None).await.unwrap() {
        ConsumeOutcome::Consumer(consumer) => consumer.id,
        other => panic!("Expected consumer, got {:?}", other),
    };

    publisher.unpublish(producer_id).await.unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
        .await
        .expect("Timed out waiting for notification");
    assert_eq!(
        notification,
        Some(Notification::ConsumerClosed {
            consumer_id,
            producer_id
        })
    );
    assert_eq!(engine.consumer_count(), 0);

    // The consumer is gone for its owner too
    let resumed = subscriber.resume(consumer_id).await;
    assert!(matches!(resumed, Err(SignalingError::UnknownResource(_))));

    publisher.close().await;
    subscriber.close().await;
    server_handle.abort();
}

/// Test: Server-side connectivity failure
/// Given a connected send transport with a producer
/// When the engine reports the transport failed
/// Then the client is told transportClosed and the resources are gone
#[tokio::test]
async fn test_transport_failure_is_notified() {
    let port = common::find_available_port();
    let (engine, server_handle) = start_test_server(port).await;

    let channel = connect(port).await;
    let mut notifications = channel.take_notifications().unwrap();
    let (transport_id, _) = publish(&channel, MediaKind::Video).await;

    engine.fail_transport(transport_id).unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
        .await
        .expect("Timed out waiting for notification");
    assert_eq!(
        notification,
        Some(Notification::TransportClosed { transport_id })
    );
    assert_eq!(engine.transport_count(), 0);
    assert_eq!(engine.producer_count(), 0);

    channel.close().await;
    server_handle.abort();
}

/// Test: Disconnect releases the session
/// Given a client with two transports and a producer
/// When it disconnects
/// Then the server releases all of them
#[tokio::test]
async fn test_disconnect_releases_resources() {
    let port = common::find_available_port();
    let (engine, server_handle) = start_test_server(port).await;

    let channel = connect(port).await;
    publish(&channel, MediaKind::Video).await;
    channel
        .create_transport(TransportDirection::Recv)
        .await
        .unwrap();
    assert_eq!(engine.transport_count(), 2);

    channel.close().await;

    let released = eventually(|| engine.transport_count() == 0 && engine.producer_count() == 0).await;
    server_handle.abort();

    assert!(released, "Session resources should be released on disconnect");
}

/// Test: Malformed request
/// Given a raw WebSocket client
/// When it sends a request with invalid params
/// Then it gets exactly one BadRequest response for that id
#[tokio::test]
async fn test_malformed_request_gets_bad_request() {
    let port = common::find_available_port();
    let (_engine, server_handle) = start_test_server(port).await;

    let (mut ws, _) = connect_async(server_url(port).as_str()).await.unwrap();
    ws.send(Message::Text(
        r#"{"type":"request","id":41,"request":{"method":"produce","params":{"kind":"video"}}}"#
            .to_string(),
    ))
    .await
    .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timed out waiting for reply");
    let _ = ws.close(None).await;
    server_handle.abort();

    let text = match reply {
        Some(Ok(Message::Text(text))) => text,
        other => panic!("Expected text reply, got {:?}", other),
    };
    match Frame::from_json(&text).unwrap() {
        Frame::Response { id, result } => {
            assert_eq!(id, 41);
            assert_eq!(result.unwrap_err().code, ErrorCode::BadRequest);
        }
        other => panic!("Expected response, got {:?}", other),
    }
}

/// Test: Connection refused
/// Given no server on the port
/// When a client connects
/// Then connect fails
#[tokio::test]
async fn test_connection_refused() {
    let port = common::find_available_port();
    let result = SignalingClient::new(ClientConfig::new(&server_url(port)))
        .connect()
        .await;
    assert!(result.is_err(), "Should fail without a server");
}
