//! Collector daemon: probes targets, summarizes, serves the API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netpulse::collector::Collector;
use netpulse::config::CollectorConfig;
use netpulse::{api, reflector};

/// Sends UDP probes to reflectors and serves latency/loss summaries.
#[derive(Parser, Debug)]
#[command(name = "netpulse-collector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file to load; the built-in defaults apply when omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Destination port applied to targets from a legacy config
    #[arg(long = "dst-port", default_value_t = reflector::DEFAULT_REFLECTOR_PORT)]
    dst_port: u16,
}

impl Args {
    fn load_config(&self) -> Result<CollectorConfig> {
        match &self.config {
            Some(path) => CollectorConfig::load(path, self.dst_port),
            None => {
                info!("no config provided, using built-in defaults");
                CollectorConfig::default_config()
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = args.load_config().context("failed to load configuration")?;

    let cancel = CancellationToken::new();
    let mut collector = Collector::new(cfg, cancel.clone());
    collector.start()?;

    let api_task = tokio::spawn(api::serve(
        collector.api_bind(),
        collector.api_state(),
        cancel.clone(),
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match args.load_config() {
                    Ok(cfg) => {
                        if let Err(e) = collector.reload(cfg) {
                            error!(error = %e, "reload failed");
                        }
                    }
                    // A broken file on disk must not take the daemon down
                    // mid-run; keep measuring with the old config.
                    Err(e) => error!(error = %e, "ignoring unloadable configuration"),
                }
            }
        }
    }

    collector.stop();
    collector.join_workers();
    api_task.await??;
    info!("collector shut down");
    Ok(())
}
