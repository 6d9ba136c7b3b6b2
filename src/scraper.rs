//! Scraper: pulls data points from collectors and writes them to InfluxDB.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::client::CollectorClient;
use crate::points::DataPoint;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes batches of data points to an InfluxDB v1 endpoint using the line
/// protocol, second precision.
pub struct InfluxWriter {
    http: reqwest::Client,
    write_url: String,
    user: Option<String>,
    password: Option<String>,
}

impl InfluxWriter {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        user: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .context("failed to build InfluxDB client")?;
        // Second precision keeps the write path cheap; nothing downstream
        // wants finer summary timestamps.
        let write_url = format!("http://{host}:{port}/write?db={database}&precision=s");
        info!(url = %write_url, "created InfluxDB writer");
        Ok(Self {
            http,
            write_url,
            user,
            password,
        })
    }

    /// Render a batch in line protocol form.
    pub fn batch(points: &[DataPoint]) -> String {
        let mut lines = String::new();
        for point in points {
            lines.push_str(&escape_measurement(&point.measurement));
            // Tags sorted for a stable series key.
            let mut tags: Vec<_> = point.tags.iter().collect();
            tags.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in tags {
                lines.push(',');
                lines.push_str(&escape_tag(key));
                lines.push('=');
                lines.push_str(&escape_tag(value));
            }
            lines.push(' ');
            let mut first = true;
            for (key, value) in &point.fields {
                if !first {
                    lines.push(',');
                }
                first = false;
                // {:?} keeps a decimal point on integral values, so field
                // types never flip between writes.
                lines.push_str(&format!("{}={:?}", escape_tag(key), value));
            }
            lines.push(' ');
            lines.push_str(&point.time.timestamp().to_string());
            lines.push('\n');
        }
        lines
    }

    /// Write one batch; non-2xx responses are errors.
    pub async fn write(&self, points: &[DataPoint]) -> Result<()> {
        let body = Self::batch(points);
        let mut request = self.http.post(&self.write_url).body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let started = Instant::now();
        let response = request.send().await.context("InfluxDB write failed")?;
        let elapsed = started.elapsed();
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("InfluxDB write returned {status} after {elapsed:?}: {body}");
        }
        info!(points = points.len(), elapsed = ?elapsed, "db write completed");
        Ok(())
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Pulls stats from a set of collectors and writes them to the backend.
pub struct Scraper {
    collectors: Vec<CollectorClient>,
    writer: InfluxWriter,
}

impl Scraper {
    pub fn new(hostnames: &[String], collector_port: u16, writer: InfluxWriter) -> Result<Self> {
        let collectors = hostnames
            .iter()
            .map(|host| CollectorClient::new(host.clone(), collector_port))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { collectors, writer })
    }

    /// One collection cycle: every collector pulled concurrently, each
    /// batch written as it lands. Per-collector failures are logged and do
    /// not fail the cycle.
    pub async fn run_cycle(&self) {
        info!("collection cycle starting");
        let mut tasks = JoinSet::new();
        for client in &self.collectors {
            let client = client.clone();
            tasks.spawn(async move {
                let points = client.points().await;
                (client, points)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let Ok((client, points)) = joined else {
                continue;
            };
            match points {
                Ok(points) => {
                    info!(collector = client.hostname(), points = points.len(), "pulled data points");
                    if let Err(e) = self.writer.write(&points).await {
                        error!(collector = client.hostname(), error = %e, "write failed");
                    }
                }
                Err(e) => {
                    error!(collector = client.hostname(), error = %e, "collection failed");
                }
            }
        }
        info!("collection cycle complete");
    }
}
