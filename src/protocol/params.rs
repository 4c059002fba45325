//! Media parameter blobs exchanged between the media engine and the peer
//!
//! These structures are relayed, not interpreted: the signaling layer only
//! reads the few fields it needs (codec identity for the compatibility check,
//! encoding count for simulcast detection).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TransportId = Uuid;
pub type ProducerId = Uuid;
pub type ConsumerId = Uuid;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Direction of a transport as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media (producer transport)
    Send,
    /// Client receives media (consumer transport)
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// A codec a party is able to send or receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl RtpCodecCapability {
    /// Same mime type (case-insensitive) and clock rate
    pub fn matches(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type) && self.clock_rate == clock_rate
    }
}

/// Router or device RTP capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Look up a codec by mime type and clock rate
    pub fn find_codec(&self, mime_type: &str, clock_rate: u32) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches(mime_type, clock_rate))
    }

    pub fn supports_kind(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind)
    }
}

/// Codec as negotiated inside concrete RTP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

/// One encoding (layer) of a stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
}

/// RTP parameters of a sent or received stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpParameters {
    /// More than one encoding means the sender is simulcasting
    pub fn is_simulcast(&self) -> bool {
        self.encodings.len() > 1
    }
}

/// ICE credentials of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

/// One ICE candidate gathered by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: IceProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS role and certificate fingerprints of one side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything the peer needs to construct its side of a server transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectionParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
}

/// Parameters the peer needs to receive a consumed stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

/// Result of a consume request
///
/// Incompatible capabilities or a missing producer are not errors: the
/// caller gets `Unavailable` and may try again later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ConsumeOutcome {
    Consumer(ConsumerParams),
    Unavailable { reason: String },
}

impl ConsumeOutcome {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ConsumeOutcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ConsumeOutcome::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_params_use_camel_case() {
        let params = TransportConnectionParams {
            id: Uuid::new_v4(),
            ice_parameters: IceParameters {
                username_fragment: "frag".to_string(),
                password: "pw".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1076302079,
                ip: "127.0.0.1".to_string(),
                protocol: IceProtocol::Udp,
                port: 10000,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![],
            },
        };

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["iceParameters"]["usernameFragment"], "frag");
        assert_eq!(json["iceCandidates"][0]["type"], "host");
        assert_eq!(json["iceCandidates"][0]["protocol"], "udp");
        assert_eq!(json["dtlsParameters"]["role"], "auto");
    }

    #[test]
    fn test_consume_outcome_tagging() {
        let json = serde_json::to_value(ConsumeOutcome::unavailable("no producer")).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["reason"], "no producer");
    }

    #[test]
    fn test_codec_lookup_ignores_mime_case() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
            }],
            header_extensions: vec![],
        };

        assert!(caps.find_codec("video/vp8", 90_000).is_some());
        assert!(caps.find_codec("video/VP8", 48_000).is_none());
        assert!(caps.supports_kind(MediaKind::Video));
        assert!(!caps.supports_kind(MediaKind::Audio));
    }
}
