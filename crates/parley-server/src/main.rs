//! Parley server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on all interfaces, port 4567
//! parley-server
//!
//! # Loopback only, slower confirmations for a lossy link
//! parley-server -l 127.0.0.1 -p 9000 -d 500 -r 5
//! ```

use std::{net::IpAddr, time::Duration};

use clap::Parser;
use parley_core::reliability::{
    DEFAULT_CONFIRMATION_TIMEOUT, DEFAULT_MAX_RETRANSMISSIONS, ReliabilityConfig,
};
use parley_server::{DEFAULT_PORT, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley chat relay server
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(about = "Chat relay server speaking text over TCP and binary over UDP")]
#[command(version)]
struct Args {
    /// IP address to listen on
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// Port for both TCP and UDP
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    listen_port: u16,

    /// UDP confirmation timeout in milliseconds
    #[arg(short = 'd', long, default_value_t = duration_millis(DEFAULT_CONFIRMATION_TIMEOUT))]
    udp_confirmation_timeout: u64,

    /// Maximum number of UDP retransmissions
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRANSMISSIONS)]
    udp_retry_count: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Parley server starting");

    let config = ServerRuntimeConfig {
        listen_ip: args.listen_ip,
        listen_port: args.listen_port,
        reliability: ReliabilityConfig {
            confirmation_timeout: Duration::from_millis(args.udp_confirmation_timeout),
            max_retransmissions: args.udp_retry_count,
        },
    };

    let server = Server::bind(config).await?;

    tracing::info!(
        "Server listening on {} (tcp) and {} (udp)",
        server.tcp_addr()?,
        server.udp_addr()?
    );

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for interrupt: {}", e);
            return;
        }
        tracing::info!("Interrupt received, shutting down");
        shutdown.cancel();
    });

    server.run().await?;

    Ok(())
}
