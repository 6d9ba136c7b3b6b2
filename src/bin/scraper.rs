//! Scraper daemon: pulls data points from collectors and writes them to
//! InfluxDB.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netpulse::scraper::{InfluxWriter, Scraper};

/// Collects stats from netpulse collectors into a time-series database.
#[derive(Parser, Debug)]
#[command(name = "netpulse-scraper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Collector hostnames to scrape
    #[arg(required = true)]
    collectors: Vec<String>,

    /// Port the collector APIs listen on
    #[arg(long = "collector-port", default_value_t = 5000)]
    collector_port: u16,

    /// InfluxDB host
    #[arg(long = "db-host", default_value = "localhost")]
    db_host: String,

    /// InfluxDB port
    #[arg(long = "db-port", default_value_t = 8086)]
    db_port: u16,

    /// InfluxDB database name
    #[arg(long = "db-name", default_value = "netpulse")]
    db_name: String,

    /// InfluxDB username
    #[arg(long = "db-user")]
    db_user: Option<String>,

    /// InfluxDB password
    #[arg(long = "db-pass")]
    db_pass: Option<String>,

    /// Seconds between collection cycles
    #[arg(short = 'i', long = "interval", default_value_t = 30)]
    interval: u64,

    /// Run a single collection cycle and exit
    #[arg(long = "once")]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let writer = InfluxWriter::new(
        &args.db_host,
        args.db_port,
        &args.db_name,
        args.db_user.clone(),
        args.db_pass.clone(),
    )?;
    let scraper = Scraper::new(&args.collectors, args.collector_port, writer)?;

    if args.once {
        scraper.run_cycle().await;
        return Ok(());
    }

    info!(interval = args.interval, collectors = args.collectors.len(), "scraper running");
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                scraper.run_cycle().await;
            }
        }
    }
}
