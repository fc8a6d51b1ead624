use std::error::Error;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use xrelay::config::{DEFAULT_LISTEN_ADDR, DEFAULT_MAX_MESSAGE_LEN, DEFAULT_UPSTREAM_ADDR};
use xrelay::{ProxyConfig, ProxyServer};

/// Transparent X11 proxy that forwards whole protocol messages
#[derive(Parser, Debug)]
#[command(name = "xrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to accept clients on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Display server to relay to
    #[arg(short, long, default_value = DEFAULT_UPSTREAM_ADDR)]
    upstream: String,

    /// Upstream connect timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    connect_timeout_ms: u64,

    /// Time a message may take to arrive once started, in milliseconds
    #[arg(long, default_value_t = 3000)]
    body_timeout_ms: u64,

    /// Largest message accepted in either direction, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_LEN)]
    max_message_len: usize,

    /// Treat core events as fixed 32-byte messages
    #[arg(long)]
    fixed_size_events: bool,

    /// Reject zero-length requests instead of reading them as BIG-REQUESTS
    #[arg(long)]
    no_big_requests: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        EnvFilter::new(format!("xrelay={}", level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ProxyConfig::new(cli.listen, cli.upstream)
        .with_connect_timeout(Duration::from_millis(cli.connect_timeout_ms))
        .with_body_timeout(Duration::from_millis(cli.body_timeout_ms))
        .with_max_message_len(cli.max_message_len)
        .with_fixed_size_events(cli.fixed_size_events)
        .with_big_requests(!cli.no_big_requests);

    let server = ProxyServer::bind(config).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            signal.cancel();
        }
    });

    server.run_until(shutdown).await?;
    Ok(())
}
