//! sfu-client - Command-line client for the SFU signaling server

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sfu_signal::config::{ClientConfig, DEFAULT_REQUEST_TIMEOUT};
use sfu_signal::network::{RpcChannel, SignalingClient};
use sfu_signal::protocol::{RtpCapabilities, TransportConnectionParams, TransportDirection};

#[derive(Parser)]
#[command(name = "sfu-client")]
#[command(about = "Command-line client for the SFU signaling server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Signaling server URL (e.g., ws://127.0.0.1:3000)
    #[arg(
        short,
        long,
        global = true,
        env = "SFU_SERVER_URL",
        default_value = "ws://127.0.0.1:3000"
    )]
    server: String,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Print raw JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the router's RTP capabilities
    Capabilities,

    /// Create a producer and a consumer transport, print them, then disconnect
    Probe,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("A tracing subscriber was already installed");
    }
}

fn print_capabilities(caps: &RtpCapabilities) {
    println!("Router codecs:");
    for codec in &caps.codecs {
        let channels = codec
            .channels
            .map(|c| format!("/{}", c))
            .unwrap_or_default();
        let payload_type = codec
            .preferred_payload_type
            .map(|pt| format!(" (pt {})", pt))
            .unwrap_or_default();
        println!(
            "  {:<6} {}/{}{}{}",
            codec.kind, codec.mime_type, codec.clock_rate, channels, payload_type
        );
    }
    println!("Header extensions: {}", caps.header_extensions.len());
}

fn print_transport(direction: TransportDirection, params: &TransportConnectionParams) {
    println!("{} transport {}", direction, params.id);
    println!(
        "  ICE: ufrag={} lite={}",
        params.ice_parameters.username_fragment, params.ice_parameters.ice_lite
    );
    for candidate in &params.ice_candidates {
        println!(
            "  candidate {} {}:{} {:?} priority {}",
            candidate.candidate_type,
            candidate.ip,
            candidate.port,
            candidate.protocol,
            candidate.priority
        );
    }
    for fingerprint in &params.dtls_parameters.fingerprints {
        println!("  DTLS {} {}", fingerprint.algorithm, fingerprint.value);
    }
}

async fn open_channel(server: &str, timeout_ms: u64) -> Result<RpcChannel> {
    let config = ClientConfig {
        server_url: server.to_string(),
        request_timeout: Duration::from_millis(timeout_ms),
    };
    info!("Connecting to signaling server: {}", server);
    SignalingClient::new(config)
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", server))
}

async fn run_capabilities(channel: &RpcChannel, json: bool) -> Result<()> {
    let caps = channel.get_router_rtp_capabilities().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
    } else {
        print_capabilities(&caps);
    }
    Ok(())
}

async fn run_probe(channel: &RpcChannel, json: bool) -> Result<()> {
    let caps = channel.get_router_rtp_capabilities().await?;
    info!("Router offers {} codecs", caps.codecs.len());

    for direction in [TransportDirection::Send, TransportDirection::Recv] {
        let params = channel
            .create_transport(direction)
            .await
            .with_context(|| format!("creating {} transport", direction))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&params)?);
        } else {
            print_transport(direction, &params);
        }
    }

    info!("Probe complete; disconnecting releases both transports");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let channel = open_channel(&cli.server, cli.timeout_ms).await?;
    let result = match cli.command {
        Commands::Capabilities => run_capabilities(&channel, cli.json).await,
        Commands::Probe => run_probe(&channel, cli.json).await,
    };
    channel.close().await;

    result
}
