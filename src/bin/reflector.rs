//! Reflector daemon: echoes probes back to collectors.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netpulse::reflector::Reflector;

/// Listens for UDP probes and sends them back with the requested ToS.
#[derive(Parser, Debug)]
#[command(name = "netpulse-reflector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0:8100")]
    bind: SocketAddr,

    /// Maximum datagrams reflected per second
    #[arg(long = "pps", default_value_t = 10_000.0)]
    pps: f64,

    /// Socket read timeout in milliseconds
    #[arg(long = "read-timeout-ms", default_value_t = 200)]
    read_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.pps > 0.0, "--pps must be positive");

    let cancel = CancellationToken::new();
    let reflector = Reflector::bind(
        args.bind,
        args.pps,
        Duration::from_millis(args.read_timeout_ms),
        cancel.clone(),
    )?;
    info!(local = %reflector.local_addr(), pps = args.pps, "reflector ready");
    let handle = reflector.spawn();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    handle.join().ok();
    Ok(())
}
