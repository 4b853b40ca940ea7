//! Voice Room Server - Main Entry Point
//!
//! TCP (optionally TLS) listener feeding the signaling relay.

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use voice_room::transport::{load_tls_acceptor, serve_connection};
use voice_room::{Relay, RoomRegistry, ServerConfig};

/// Relay event backlog shared by all connections
const EVENT_QUEUE_LEN: usize = 1024;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "voice-room-server")]
#[command(about = "Voice Room Server - presence and signaling relay")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override signaling port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config.to_string_lossy())?
    } else {
        info!("Config file not found, using defaults");
        ServerConfig::default()
    };
    config.validate()?;

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let acceptor = match (&config.certfile, &config.keyfile) {
        (Some(certfile), Some(keyfile)) => Some(load_tls_acceptor(certfile, keyfile)?),
        _ => {
            info!("No certificate configured; serving plain TCP");
            None
        }
    };

    let registry = RoomRegistry::new(config.room_capacity, config.empty_room_retention());
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LEN);
    tokio::spawn(Relay::new(registry).run(
        events_rx,
        config.sweep_interval(),
        config.empty_room_retention(),
    ));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Voice Room Server listening on {} (capacity {}, empty rooms kept {}s)",
        addr, config.room_capacity, config.empty_room_retention_secs
    );

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let acceptor = acceptor.clone();
        let events = events_tx.clone();
        let max_frame_len = config.max_frame_len;

        tokio::spawn(async move {
            let peer = peer_addr.to_string();
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("New TLS connection from {}", peer_addr);
                        serve_connection(tls_stream, peer, events, max_frame_len).await
                    }
                    Err(e) => {
                        error!("TLS handshake failed for {}: {}", peer_addr, e);
                        return;
                    }
                },
                None => {
                    info!("New connection from {}", peer_addr);
                    serve_connection(stream, peer, events, max_frame_len).await
                }
            };
            match result {
                Ok(()) => info!("Client {} disconnected", peer_addr),
                Err(e) => error!("Client {} error: {}", peer_addr, e),
            }
        });
    }
}
