//! HTTP client for pulling data points from collectors.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::points::DataPoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one collector's read surface.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    hostname: String,
    port: u16,
    http: reqwest::Client,
}

impl CollectorClient {
    pub fn new(hostname: impl Into<String>, port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            hostname: hostname.into(),
            port,
            http,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fetch the collector's current data points.
    pub async fn points(&self) -> Result<Vec<DataPoint>> {
        let url = format!("http://{}:{}/influxdata", self.hostname, self.port);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{url} returned {status}: {body}");
        }
        response
            .json()
            .await
            .with_context(|| format!("invalid data point payload from {url}"))
    }
}
