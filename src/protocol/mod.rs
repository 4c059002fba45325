//! Signaling protocol definitions
//!
//! Defines the request/response frames and the media parameter blobs they carry.

mod message;
mod params;

pub use message::{ErrorCode, Frame, Notification, Reply, Request, RpcFailure};
pub use params::{
    ConsumeOutcome, ConsumerId, ConsumerParams, ConsumerType, DtlsFingerprint, DtlsParameters,
    DtlsRole, IceCandidate, IceParameters, IceProtocol, MediaKind, ProducerId, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    TransportConnectionParams, TransportDirection, TransportId,
};
