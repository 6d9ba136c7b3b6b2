//! Collector assembly: wires the probe pipeline to the summarizer and the
//! HTTP surface, and owns reload/shutdown.
//!
//! Data flow:
//! `TestRunner → PortGroup → Port.send → wire → reflector → wire →
//! Port.recv → cache hit | TTL expiry → ResultHandler → Summarizer →
//! summary cache → HTTP`.

pub mod cache;
pub mod group;
pub mod handler;
pub mod port;
pub mod ratelimit;
pub mod runner;
pub mod summary;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::ApiState;
use crate::config::CollectorConfig;
use crate::probe::{Probe, ProbeResult};
use handler::ResultHandler;
use ratelimit::RateLimiter;
use runner::{RunnerHandle, TestRunner};
use summary::Summarizer;

/// Buffer for the completed-probe and result channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 100;

/// The collector daemon: probe pipeline, summarizer, and API state.
pub struct Collector {
    cfg: CollectorConfig,
    cancel: CancellationToken,
    /// Child token scoped to the current generation of test runners, so a
    /// reload can stop them without touching the summarizer or API.
    runner_cancel: CancellationToken,
    // The probe channel outlives reloads: replacing it would orphan
    // probes still sitting in port caches.
    cbc_tx: Sender<Probe>,
    cbc_rx: Receiver<Probe>,
    results_tx: Sender<ProbeResult>,
    api_state: ApiState,
    summarizer: Summarizer,
    runner_handles: Vec<RunnerHandle>,
    worker_threads: Vec<std::thread::JoinHandle<()>>,
}

impl Collector {
    /// Build all long-lived pieces from a validated config. Nothing runs
    /// until [`Collector::start`].
    pub fn new(cfg: CollectorConfig, cancel: CancellationToken) -> Self {
        let (cbc_tx, cbc_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
        let (results_tx, results_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);

        let summarizer = Summarizer::new(
            results_rx,
            cfg.interval(),
            summary::DEFAULT_STORE_WORKERS,
            cancel.clone(),
        );
        let api_state = ApiState::new(summarizer.cache(), cfg.tag_set());
        let runner_cancel = cancel.child_token();

        Self {
            cfg,
            cancel,
            runner_cancel,
            cbc_tx,
            cbc_rx,
            results_tx,
            api_state,
            summarizer,
            runner_handles: Vec::new(),
            worker_threads: Vec::new(),
        }
    }

    /// Read surface shared with the API server.
    pub fn api_state(&self) -> ApiState {
        self.api_state.clone()
    }

    pub fn api_bind(&self) -> std::net::SocketAddr {
        self.cfg.api_bind()
    }

    /// Start the summarizer, result handlers, and test runners.
    pub fn start(&mut self) -> Result<()> {
        info!("starting collector");
        let summarizer_handle = self.summarizer.run();
        self.worker_threads.extend(summarizer_handle.store_threads);

        info!(handlers = self.cfg.summarization.handlers, "starting result handlers");
        for _ in 0..self.cfg.summarization.handlers {
            let handler = ResultHandler::new(
                self.cbc_rx.clone(),
                self.results_tx.clone(),
                self.cancel.clone(),
            );
            self.worker_threads.push(handler.spawn());
        }

        self.start_runners()?;
        info!("all collector components running");
        Ok(())
    }

    /// Build and start one TestRunner per configured test.
    fn start_runners(&mut self) -> Result<()> {
        info!(tests = self.cfg.tests.len(), "starting test runners");
        for (i, test) in self.cfg.tests.iter().enumerate() {
            let rate = self.cfg.rate_limits[&test.rate_limit].cps;
            let mut runner = TestRunner::new(
                self.cbc_tx.clone(),
                RateLimiter::new(rate),
                self.runner_cancel.clone(),
            );

            for member in &self.cfg.port_groups[&test.port_group] {
                let port_cfg = &self.cfg.ports[&member.port];
                let bind = port_cfg.bind_addr()?;
                let timeout = port_cfg.timeout();
                for _ in 0..member.count {
                    runner
                        .add_port(bind, port_cfg.tos, timeout, timeout, timeout)
                        .with_context(|| format!("failed to add port {:?} to test #{i}", member.port))?;
                }
            }

            let targets = self.cfg.resolved_targets(&test.targets)?;
            info!(
                test = i,
                targets = targets.len(),
                ports = runner.port_count(),
                cps = rate,
                "test runner configured"
            );
            runner.targets().set(targets);
            self.runner_handles.push(runner.run());
        }
        Ok(())
    }

    /// Apply a new configuration: merge tags, replace the runners, leave
    /// the summarizer and API untouched.
    pub fn reload(&mut self, cfg: CollectorConfig) -> Result<()> {
        info!("reloading collector");
        self.cfg = cfg;

        // Merging rather than replacing keeps tags for hosts that left the
        // config but still have results in flight.
        self.api_state.merge_tags(self.cfg.tag_set());

        if !self.runner_handles.is_empty() {
            info!("stopping old test runners");
            self.runner_cancel.cancel();
            self.runner_handles.clear();
        }
        self.runner_cancel = self.cancel.child_token();
        self.start_runners()?;
        info!("collector reload complete");
        Ok(())
    }

    /// Signal every component to stop.
    pub fn stop(&self) {
        info!("stopping collector");
        self.cancel.cancel();
    }

    /// Wait for the worker threads to drain after [`Collector::stop`].
    pub fn join_workers(&mut self) {
        for thread in self.worker_threads.drain(..) {
            if thread.join().is_err() {
                warn!("collector worker panicked");
            }
        }
    }
}
