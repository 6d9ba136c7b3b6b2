//! Windowed summarization of probe results.
//!
//! Store workers bucket inbound results by `(src_ip, dst_ip)`. On each
//! aligned tick the bucket map is swapped out whole, summarized, and the
//! finished slice is published atomically for the HTTP surface to read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::probe::{now_ns, PathDist, ProbeResult};

/// Workers appending results into the active bucket map.
pub const DEFAULT_STORE_WORKERS: usize = 2;
/// Window length between summarizations.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Aggregate statistics for one path over one window. RTT fields are in
/// milliseconds; they are all 0.0 when every probe in the window was lost.
#[derive(Debug, Clone)]
pub struct Summary {
    pub path: PathDist,
    pub ts: DateTime<Utc>,
    pub rtt_avg: f64,
    pub rtt_min: f64,
    pub rtt_max: f64,
    pub sent: usize,
    pub lost: usize,
    pub loss_pct: f64,
}

/// Read-mostly cache of the latest window's summaries. Writers swap the
/// inner Arc under a brief exclusive lock; readers clone it and work on a
/// consistent snapshot without holding anything.
#[derive(Clone, Default)]
pub struct SummaryCache {
    inner: Arc<RwLock<Arc<Vec<Summary>>>>,
}

impl SummaryCache {
    pub fn snapshot(&self) -> Arc<Vec<Summary>> {
        Arc::clone(&self.inner.read())
    }

    pub(crate) fn publish(&self, summaries: Vec<Summary>) {
        *self.inner.write() = Arc::new(summaries);
    }
}

/// Grouping key: only source and destination IPs distinguish buckets;
/// ports and protocol would multiply the series without adding signal.
pub fn bucket_key(path: &PathDist) -> String {
    format!("src_{}->dst_{}", path.src_ip, path.dst_ip)
}

fn ns_to_ms(ns: f64) -> f64 {
    ns / 1_000_000.0
}

/// Summarize one bucket. All results share a path by construction; `None`
/// for an empty bucket (which store never produces, but the tick loop
/// checks anyway).
pub fn summarize_set(results: &[ProbeResult]) -> Option<Summary> {
    let first = results.first()?;

    let sent = results.len();
    let lost = results.iter().filter(|r| r.lost).count();
    let loss_pct = if sent > 0 {
        (lost as f64 / sent as f64) * 100.0
    } else {
        // Never NaN: JSON has no encoding for it and "no probes" is not
        // loss.
        0.0
    };

    let mut rtt_avg = 0.0;
    let mut rtt_min = 0.0;
    let mut rtt_max = 0.0;
    let completed: Vec<f64> = results
        .iter()
        .filter(|r| !r.lost)
        .map(|r| ns_to_ms(r.rtt_ns as f64))
        .collect();
    if !completed.is_empty() {
        rtt_avg = completed.iter().sum::<f64>() / completed.len() as f64;
        rtt_min = completed.iter().cloned().fold(f64::MAX, f64::min);
        rtt_max = completed.iter().cloned().fold(0.0, f64::max);
    }

    Some(Summary {
        path: first.path.clone(),
        ts: Utc::now(),
        rtt_avg,
        rtt_min,
        rtt_max,
        sent,
        lost,
        loss_pct,
    })
}

type BucketMap = HashMap<String, Vec<ProbeResult>>;

/// Receives results, buckets them, and summarizes on a fixed tick.
pub struct Summarizer {
    results: Receiver<ProbeResult>,
    buckets: Arc<Mutex<BucketMap>>,
    cache: SummaryCache,
    interval: Duration,
    workers: usize,
    cancel: CancellationToken,
}

/// Handles for the tick task and the store worker threads.
pub struct SummarizerHandle {
    pub tick_task: tokio::task::JoinHandle<()>,
    pub store_threads: Vec<std::thread::JoinHandle<()>>,
}

impl Summarizer {
    pub fn new(
        results: Receiver<ProbeResult>,
        interval: Duration,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            results,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            cache: SummaryCache::default(),
            interval,
            workers: workers.max(1),
            cancel,
        }
    }

    /// The cache this summarizer publishes into.
    pub fn cache(&self) -> SummaryCache {
        self.cache.clone()
    }

    /// Start the store workers and the tick loop.
    pub fn run(&self) -> SummarizerHandle {
        let store_threads = (0..self.workers)
            .map(|_| {
                let results = self.results.clone();
                let buckets = Arc::clone(&self.buckets);
                let cancel = self.cancel.clone();
                std::thread::spawn(move || store_loop(results, buckets, cancel))
            })
            .collect();

        let tick_task = tokio::spawn(tick_loop(
            Arc::clone(&self.buckets),
            self.cache.clone(),
            self.interval,
            self.cancel.clone(),
        ));

        SummarizerHandle {
            tick_task,
            store_threads,
        }
    }
}

fn store_loop(results: Receiver<ProbeResult>, buckets: Arc<Mutex<BucketMap>>, cancel: CancellationToken) {
    loop {
        match results.recv_timeout(POLL_INTERVAL) {
            Ok(result) => {
                let key = bucket_key(&result.path);
                buckets.lock().entry(key).or_default().push(result);
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    debug!("summarizer store worker stopped");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("result channel closed, store worker exiting");
                return;
            }
        }
    }
}

/// Sleep until the next wall-clock multiple of `interval`, then summarize
/// every interval. The alignment sleep plus `interval_at` means the first
/// window always covers at least one full interval of results.
async fn tick_loop(
    buckets: Arc<Mutex<BucketMap>>,
    cache: SummaryCache,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval_ns = interval.as_nanos().max(1) as u64;
    let offset_ns = interval_ns - (now_ns() % interval_ns);
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_nanos(offset_ns)) => {}
    }

    info!(interval = ?interval, "starting summarization ticker");
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("summarizer tick loop stopped");
                return;
            }
            _ = ticker.tick() => {
                summarize(&buckets, &cache);
            }
        }
    }
}

/// Swap the bucket map out whole and publish the resulting summaries.
fn summarize(buckets: &Mutex<BucketMap>, cache: &SummaryCache) {
    let taken = {
        let mut buckets = buckets.lock();
        std::mem::take(&mut *buckets)
    };
    debug!(buckets = taken.len(), "summarizing results");

    let mut summaries = Vec::with_capacity(taken.len());
    for results in taken.values() {
        if let Some(summary) = summarize_set(results) {
            summaries.push(summary);
        }
    }
    info!(summaries = summaries.len(), "summarization complete");
    cache.publish(summaries);
}
