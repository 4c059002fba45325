//! Server and client configuration
//!
//! Defaults match a local development setup: plain WebSocket on port 3000,
//! a media engine listening on 127.0.0.1 with RTC ports 10000-10100, and a
//! router offering opus and VP8.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{MediaKind, RtpCodecCapability};

/// Default bound on a single RPC round-trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Media engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// IP the engine binds transports to
    pub listen_ip: String,
    /// IP advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Codecs the router offers
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Per-transport incoming bitrate cap (bps)
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let mut vp8_parameters = BTreeMap::new();
        vp8_parameters.insert("x-google-start-bitrate".to_string(), 1_000.into());

        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 10_000,
            rtc_max_port: 10_100,
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    preferred_payload_type: Some(100),
                    clock_rate: 48_000,
                    channels: Some(2),
                    parameters: BTreeMap::new(),
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    preferred_payload_type: Some(101),
                    clock_rate: 90_000,
                    channels: None,
                    parameters: vp8_parameters,
                },
            ],
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

impl EngineSettings {
    /// Address put into ICE candidates
    pub fn candidate_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtc_min_port > self.rtc_max_port {
            return Err(ConfigError::Invalid(format!(
                "rtc_min_port {} is above rtc_max_port {}",
                self.rtc_min_port, self.rtc_max_port
            )));
        }
        if self.media_codecs.is_empty() {
            return Err(ConfigError::Invalid(
                "router needs at least one media codec".to_string(),
            ));
        }
        Ok(())
    }
}

/// Signaling server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// TLS certificate (PEM); TLS is enabled when both cert and key are set
    pub cert: Option<PathBuf>,
    /// TLS private key (PEM)
    pub key: Option<PathBuf>,
    /// Bound on handling a single request, in milliseconds
    pub request_timeout_ms: u64,
    pub engine: EngineSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cert: None,
            key: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            engine: EngineSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.cert, &self.key) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "both cert and key must be provided for TLS".to_string(),
                ));
            }
            _ => {}
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        self.engine.validate()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signaling server URL (ws:// or wss://)
    pub server_url: String,
    /// Bound on each RPC round-trip
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.rtc_min_port, 10_000);
        assert_eq!(settings.rtc_max_port, 10_100);
        assert_eq!(settings.media_codecs.len(), 2);
        assert_eq!(settings.candidate_ip(), "127.0.0.1");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 8443, "engine": {"announced_ip": "203.0.113.5"}}"#)
                .unwrap();
        assert_eq!(config.port, 8443);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.engine.candidate_ip(), "203.0.113.5");
        assert_eq!(config.engine.rtc_max_port, 10_100);
    }

    #[test]
    fn test_half_tls_config_is_rejected() {
        let config = ServerConfig {
            cert: Some(PathBuf::from("cert.pem")),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let settings = EngineSettings {
            rtc_min_port: 20_000,
            rtc_max_port: 10_000,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
