//! HTTP surface answering queries for collected data.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collector::summary::SummaryCache;
use crate::points::DataPoint;
use crate::tags::TagSet;

/// Shared read surface: the summary cache plus the tag set applied at
/// serialization time.
#[derive(Clone)]
pub struct ApiState {
    summaries: SummaryCache,
    tags: Arc<RwLock<TagSet>>,
}

impl ApiState {
    pub fn new(summaries: SummaryCache, tags: TagSet) -> Self {
        Self {
            summaries,
            tags: Arc::new(RwLock::new(tags)),
        }
    }

    /// Merge a newer tag set into the served one. Additive; see
    /// [`TagSet::merge`].
    pub fn merge_tags(&self, newer: TagSet) {
        self.tags.write().merge(newer);
    }

    /// Current data points: summary snapshot joined with tags. The tag
    /// lock is held only while building the owned points, never during
    /// serialization.
    pub fn data_points(&self) -> Vec<DataPoint> {
        let summaries = self.summaries.snapshot();
        let tags = self.tags.read();
        DataPoint::from_summaries(&summaries, &tags)
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/influxdata", get(influx_data))
        .with_state(state)
}

/// Bare healthcheck.
async fn status() -> &'static str {
    "ok"
}

async fn influx_data(State(state): State<ApiState>) -> Json<Vec<DataPoint>> {
    let points = state.data_points();
    debug!(points = points.len(), "serving data points");
    Json(points)
}

/// Serve the API until the token is cancelled.
pub async fn serve(bind: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind API listener on {bind}"))?;
    info!(%bind, "api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("api server failed")?;
    info!("api stopped");
    Ok(())
}
