//! Shroud Server Binary
//!
//! Runs the rendezvous server and echoes every delivered payload back on
//! its session.
//!
//! ## Usage
//!
//! ```bash
//! shroud-server --generate-credentials
//! shroud-server --port 5684 --psk-identity client-1a2b --psk-key 0011...eeff
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use shroud_crypto::PskCredentials;
use shroud_server::{PskEntry, RendezvousServer, ServerConfig};
use shroud_session::{ContinuityManager, SessionHandle};
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Shroud rendezvous server
#[derive(Parser, Debug)]
#[command(name = "shroud-server")]
#[command(version)]
#[command(
    about = "Traffic-analysis-resistant datagram sessions with port hopping",
    long_about = None
)]
struct Args {
    /// Bind address
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: String,

    /// Rendezvous port
    #[arg(short = 'p', long, default_value_t = shroud_protocol::DEFAULT_RENDEZVOUS_PORT)]
    port: u16,

    /// Configuration file path
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// PSK identity to accept
    #[arg(long, requires = "psk_key")]
    psk_identity: Option<String>,

    /// PSK key as hex
    #[arg(long, requires = "psk_identity")]
    psk_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Generate sample configuration file
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Print a fresh PSK identity and key
    #[arg(long)]
    generate_credentials: bool,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(parse_level(&args.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    if args.generate_credentials {
        let creds = PskCredentials::generate()?;
        println!("identity = \"{}\"", creds.identity());
        println!("key = \"{}\"", creds.key_hex());
        return Ok(());
    }

    if let Some(path) = args.generate_config {
        let creds = PskCredentials::generate()?;
        let mut config = ServerConfig::default();
        config.psk.push(PskEntry::from_credentials(&creds));
        config.save_to_file(&path)?;
        println!("Generated sample configuration at: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            let mut config = ServerConfig::load_from_file(&path)?;
            if let (Some(identity), Some(key)) = (args.psk_identity, args.psk_key) {
                config.psk.push(PskEntry::new(identity, key));
            }
            config.validate()?;
            config
        }
        None => {
            let mut builder = ServerConfig::builder()
                .bind_address(&args.address)
                .bind_port(args.port)
                .log_level(&args.log_level);
            if let (Some(identity), Some(key)) = (args.psk_identity, args.psk_key) {
                builder = builder.psk(identity, key);
            }
            builder.build()?
        }
    };

    info!("Configuration:");
    info!("  Bind: {}:{}", config.bind_address, config.bind_port);
    info!("  Max sessions: {}", config.max_sessions);
    info!("  Buckets: {:?}", config.session.buckets);
    info!(
        "  Hopping: {} (every {}s ± {}s over {}..={})",
        config.session.hopping_enabled,
        config.session.hop_interval_secs,
        config.session.hop_jitter_secs,
        config.session.port_range[0],
        config.session.port_range[1]
    );
    info!("  Credentials: {}", config.psk.len());

    let server = Arc::new(RendezvousServer::new(config)?);

    tokio::spawn({
        let server = server.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    server.shutdown().await;
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    });

    tokio::spawn({
        let server = server.clone();
        async move {
            while let Some(handle) = server.accept().await {
                tokio::spawn(echo(server.manager().clone(), handle));
            }
        }
    });

    match server.run().await {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}

async fn echo(manager: ContinuityManager, mut handle: SessionHandle) {
    let id = handle.id();
    while let Some(payload) = handle.recv().await {
        if let Err(e) = manager.send(id, payload).await {
            debug!(session = %id, error = %e, "Echo failed");
            if !e.is_recoverable() {
                break;
            }
        }
    }
}
