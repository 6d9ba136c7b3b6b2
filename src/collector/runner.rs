//! TestRunner: cycles a target list into a PortGroup at a rate-limited
//! pace.
//!
//! One cycle is a full pass over the targets. The limiter governs cycles,
//! not probes: total probe rate is roughly
//! `cycles_per_sec × targets × ports`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collector::group::{PortGroup, PortGroupHandle};
use crate::collector::ratelimit::RateLimiter;
use crate::probe::Probe;

/// Buffered targets between the runner and its group mux.
pub const TOSEND_BUFFER: usize = 100;

/// Shared, mutable target list. Mutations take effect between cycles.
#[derive(Clone, Default)]
pub struct TargetList(Arc<RwLock<Vec<SocketAddr>>>);

impl TargetList {
    /// Replace the whole list. Preferred over add/del for larger changes:
    /// it is atomic from the runner's perspective.
    pub fn set(&self, targets: Vec<SocketAddr>) {
        *self.0.write() = targets;
    }

    pub fn add(&self, targets: impl IntoIterator<Item = SocketAddr>) {
        self.0.write().extend(targets);
    }

    /// Remove every occurrence of `target`. Unordered swap-removal; order
    /// within a cycle does not matter.
    pub fn del(&self, target: SocketAddr) {
        let mut targets = self.0.write();
        let mut i = 0;
        while i < targets.len() {
            if targets[i] == target {
                targets.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    fn snapshot(&self) -> Vec<SocketAddr> {
        self.0.read().clone()
    }
}

/// Drives one test: a PortGroup, a target list, and a cycle rate limiter.
pub struct TestRunner {
    group: PortGroup,
    tosend_tx: mpsc::Sender<SocketAddr>,
    targets: TargetList,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

/// Handles for the runner's cycle loop and its group.
pub struct RunnerHandle {
    pub cycle_task: tokio::task::JoinHandle<()>,
    pub group: PortGroupHandle,
}

impl TestRunner {
    pub fn new(cbc: Sender<Probe>, limiter: RateLimiter, cancel: CancellationToken) -> Self {
        let (tosend_tx, tosend_rx) = mpsc::channel(TOSEND_BUFFER);
        let group = PortGroup::new(tosend_rx, cbc, cancel.clone());
        Self {
            group,
            tosend_tx,
            targets: TargetList::default(),
            limiter: Arc::new(limiter),
            cancel,
        }
    }

    /// Add a Port to the runner's group. Only valid before [`run`].
    ///
    /// [`run`]: TestRunner::run
    pub fn add_port(
        &mut self,
        bind: SocketAddr,
        tos: u8,
        cache_timeout: Duration,
        clean_rate: Duration,
        read_timeout: Duration,
    ) -> Result<SocketAddr> {
        self.group
            .add_new(bind, tos, cache_timeout, clean_rate, read_timeout)
    }

    pub fn port_count(&self) -> usize {
        self.group.len()
    }

    /// Handle to the target list for mutation while running.
    pub fn targets(&self) -> TargetList {
        self.targets.clone()
    }

    /// Start the group and the cycle loop.
    pub fn run(self) -> RunnerHandle {
        let group = self.group.run();
        let cycle_task = tokio::spawn(cycle_loop(
            self.tosend_tx,
            self.targets,
            self.limiter,
            self.cancel,
        ));
        RunnerHandle { cycle_task, group }
    }
}

async fn cycle_loop(
    tosend: mpsc::Sender<SocketAddr>,
    targets: TargetList,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!("test runner stopped");
            return;
        }
        // The limiter may block for a while; check for cancellation both
        // around and during the wait.
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("test runner stopped during rate limit wait");
                return;
            }
            _ = limiter.acquire() => {}
        }

        // Snapshot under the read lock, release before the sends: the mux
        // may exert backpressure and mutators must not be blocked by it.
        let cycle = targets.snapshot();
        for target in cycle {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tosend.send(target) => {
                    if sent.is_err() {
                        debug!("test runner target stream closed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[test]
    fn target_list_set_add_del() {
        let targets = TargetList::default();
        targets.set(vec![addr(1), addr(2), addr(2)]);
        assert_eq!(targets.len(), 3);

        targets.del(addr(2));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.snapshot(), vec![addr(1)]);

        targets.add([addr(3), addr(4)]);
        assert_eq!(targets.len(), 3);

        targets.set(Vec::new());
        assert!(targets.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runner_cycles_targets_through_its_ports() {
        let (cbc_tx, _cbc_rx) = crossbeam_channel::bounded(64);
        let cancel = CancellationToken::new();
        let mut runner = TestRunner::new(cbc_tx, RateLimiter::new(20.0), cancel.clone());
        runner
            .add_port(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
                0,
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_millis(20),
            )
            .unwrap();
        assert_eq!(runner.port_count(), 1);

        let capture =
            socket::bind_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), 0,
                Duration::from_millis(500))
            .unwrap();
        let capture_addr = socket::local_addr(&capture).unwrap();

        let targets = runner.targets();
        targets.set(vec![capture_addr]);
        let handle = runner.run();

        // At 20 cps the capture socket sees a steady probe stream.
        let mut buf = [0u8; 4096];
        for _ in 0..3 {
            socket::recv_from(&capture, &mut buf).expect("expected a probe per cycle");
        }

        cancel.cancel();
        handle.cycle_task.await.unwrap();
        handle.group.mux_task.await.unwrap();
        for port in handle.group.ports {
            port.send_task.await.unwrap();
            port.recv_thread.join().unwrap();
        }
    }
}
