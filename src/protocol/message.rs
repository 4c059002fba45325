//! Signaling wire messages
//!
//! Every frame is one JSON text message on the WebSocket:
//!
//! ```text
//! {"type":"request","id":7,"request":{"method":"produce","params":{...}}}
//! {"type":"response","id":7,"result":{"Ok":{"kind":"produced","data":{...}}}}
//! {"type":"notification","notification":{"event":"consumerClosed","data":{...}}}
//! ```
//!
//! `id` is the correlation token; a response always carries the id of the
//! request it answers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::params::{
    ConsumeOutcome, ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities,
    RtpParameters, TransportConnectionParams, TransportId,
};

/// Requests a client can make, with their parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    GetRouterRtpCapabilities,
    CreateProducerTransport,
    CreateConsumerTransport,
    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_id: Option<ProducerId>,
    },
    #[serde(rename_all = "camelCase")]
    Resume { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    Unpublish { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { consumer_id: ConsumerId },
    /// Release a transport and whatever still runs on it
    #[serde(rename_all = "camelCase")]
    CloseTransport { transport_id: TransportId },
}

impl Request {
    /// Method name as it appears on the wire
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Request::CreateProducerTransport => "createProducerTransport",
            Request::CreateConsumerTransport => "createConsumerTransport",
            Request::ConnectProducerTransport { .. } => "connectProducerTransport",
            Request::ConnectConsumerTransport { .. } => "connectConsumerTransport",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
            Request::Resume { .. } => "resume",
            Request::Unpublish { .. } => "unpublish",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::CloseTransport { .. } => "closeTransport",
        }
    }
}

/// Successful results, one shape per method family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Reply {
    RtpCapabilities(RtpCapabilities),
    TransportCreated(TransportConnectionParams),
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: ProducerId,
    },
    Consumed(ConsumeOutcome),
    Ack,
}

/// Error categories carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    UnknownResource,
    InvalidState,
    NotReady,
    Timeout,
    Engine,
    BadRequest,
}

/// Error reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Unsolicited server-to-client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Notification {
    /// A consumer was closed because its producer went away
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// A transport was closed by the server after a connectivity failure
    #[serde(rename_all = "camelCase")]
    TransportClosed { transport_id: TransportId },
}

/// A frame on the signaling connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Request {
        id: u64,
        request: Request,
    },
    Response {
        id: u64,
        result: Result<Reply, RpcFailure>,
    },
    Notification {
        notification: Notification,
    },
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::params::{DtlsFingerprint, DtlsRole};
    use uuid::Uuid;

    #[test]
    fn test_request_wire_shape() {
        let transport_id = Uuid::new_v4();
        let frame = Frame::Request {
            id: 3,
            request: Request::ConnectProducerTransport {
                transport_id,
                dtls_parameters: DtlsParameters {
                    role: DtlsRole::Client,
                    fingerprints: vec![DtlsFingerprint {
                        algorithm: "sha-256".to_string(),
                        value: "AB:CD".to_string(),
                    }],
                },
            },
        };

        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["id"], 3);
        assert_eq!(json["request"]["method"], "connectProducerTransport");
        assert_eq!(
            json["request"]["params"]["transportId"],
            transport_id.to_string()
        );
        assert_eq!(json["request"]["params"]["dtlsParameters"]["role"], "client");
    }

    #[test]
    fn test_parameterless_request_parses() {
        let text = r#"{"type":"request","id":1,"request":{"method":"getRouterRtpCapabilities"}}"#;
        match Frame::from_json(text).unwrap() {
            Frame::Request { id, request } => {
                assert_eq!(id, 1);
                assert_eq!(request, Request::GetRouterRtpCapabilities);
                assert_eq!(request.method(), "getRouterRtpCapabilities");
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_error_response_parses() {
        let text = r#"{"type":"response","id":9,"result":{"Err":{"code":"unknownResource","message":"no such transport"}}}"#;
        match Frame::from_json(text).unwrap() {
            Frame::Response { id, result } => {
                assert_eq!(id, 9);
                let failure = result.unwrap_err();
                assert_eq!(failure.code, ErrorCode::UnknownResource);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let text = r#"{"type":"request","id":1,"request":{"method":"reboot"}}"#;
        assert!(Frame::from_json(text).is_err());
    }
}
