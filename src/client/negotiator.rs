//! Capability negotiation
//!
//! The router's capabilities are fetched once per connection and loaded into
//! the local stack; nothing media-related may happen before that.

use tracing::{debug, info};

use super::media_stack::PeerMediaStack;
use crate::network::{RpcChannel, SignalingError};
use crate::protocol::{MediaKind, RtpCapabilities};

/// Capabilities negotiated for one connection
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedCapabilities {
    router: RtpCapabilities,
    local: RtpCapabilities,
}

impl NegotiatedCapabilities {
    /// Fetch router capabilities and load them into the local stack
    pub async fn negotiate(
        channel: &RpcChannel,
        stack: &dyn PeerMediaStack,
    ) -> Result<Self, SignalingError> {
        let router = channel.get_router_rtp_capabilities().await?;
        debug!("Router offers {} codecs", router.codecs.len());

        let local = stack.load(&router).await?;
        info!(
            "Capabilities negotiated ({} of {} codecs usable)",
            local.codecs.len(),
            router.codecs.len()
        );
        Ok(Self { router, local })
    }

    pub fn router(&self) -> &RtpCapabilities {
        &self.router
    }

    /// What the local device can receive; sent with consume requests
    pub fn local(&self) -> &RtpCapabilities {
        &self.local
    }

    /// Both the router and the device handle `kind`
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.router.supports_kind(kind) && self.local.supports_kind(kind)
    }
}

/// Keep the router codecs the device also supports, with the router's
/// payload types
///
/// Header extensions are kept when both sides list the same URI.
pub fn intersect_capabilities(
    router: &RtpCapabilities,
    device: &RtpCapabilities,
) -> RtpCapabilities {
    let codecs = router
        .codecs
        .iter()
        .filter(|codec| {
            device
                .codecs
                .iter()
                .any(|d| d.kind == codec.kind && d.matches(&codec.mime_type, codec.clock_rate))
        })
        .cloned()
        .collect();

    let header_extensions = router
        .header_extensions
        .iter()
        .filter(|ext| {
            let uri = ext.get("uri");
            uri.is_some() && device.header_extensions.iter().any(|d| d.get("uri") == uri)
        })
        .cloned()
        .collect();

    RtpCapabilities {
        codecs,
        header_extensions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;

    #[test]
    fn test_intersection_keeps_common_codecs() {
        let router = RtpCapabilities {
            codecs: EngineSettings::default().media_codecs,
            header_extensions: Vec::new(),
        };
        let device = RtpCapabilities {
            codecs: router
                .codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .cloned()
                .collect(),
            header_extensions: Vec::new(),
        };

        let common = intersect_capabilities(&router, &device);
        assert_eq!(common.codecs.len(), 1);
        assert!(common.supports_kind(MediaKind::Audio));
        assert!(!common.supports_kind(MediaKind::Video));
    }
}
