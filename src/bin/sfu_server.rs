//! Standalone SFU signaling server binary
//!
//! Run with:
//!   cargo run --bin sfu-server -- --port 3000
//!
//! With TLS:
//!   cargo run --bin sfu-server -- --port 8443 --cert cert.pem --key key.pem
//!
//! With a configuration file (command-line flags win over file values):
//!   cargo run --bin sfu-server -- --config server.json

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn, Level};

use sfu_signal::config::ServerConfig;
use sfu_signal::engine::{LoopbackEngine, MediaEngine};
use sfu_signal::network::SignalingServer;

/// Signaling server for SFU sessions
#[derive(Parser, Debug)]
#[command(name = "sfu-server")]
#[command(about = "Signaling server for SFU sessions")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "SFU_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SFU_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SFU_HOST")]
    host: Option<String>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, env = "SFU_CERT")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, env = "SFU_KEY")]
    key: Option<PathBuf>,

    /// IP advertised in ICE candidates
    #[arg(long, env = "SFU_ANNOUNCED_IP")]
    announced_ip: Option<String>,

    /// Per-request handling timeout in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Configuration file (or defaults) with flags applied on top
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if self.cert.is_some() {
            config.cert = self.cert.clone();
        }
        if self.key.is_some() {
            config.key = self.key.clone();
        }
        if self.announced_ip.is_some() {
            config.engine.announced_ip = self.announced_ip.clone();
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Load TLS certificates from PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("No certificate found in {}", path.display());
    }
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    bail!("No private key found in {}", path.display())
}

/// Create TLS acceptor from certificate and key files
fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let config = args.server_config()?;
    let addr = config.listen_addr();

    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new(config.engine.clone()));
    info!(
        "Media engine: {} codecs, RTC ports {}-{}, announcing {}",
        config.engine.media_codecs.len(),
        config.engine.rtc_min_port,
        config.engine.rtc_max_port,
        config.engine.candidate_ip()
    );

    let server = SignalingServer::new(engine, &config);

    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            let acceptor = create_tls_acceptor(cert, key)?;
            server.run_tls(&addr, acceptor).await?;
        }
        _ => {
            warn!("TLS disabled - running in plain WebSocket mode");
            warn!("For production, use --cert and --key to enable TLS");
            server.run(&addr).await?;
        }
    }

    Ok(())
}
