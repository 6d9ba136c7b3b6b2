//! ResultHandler: converts finished or expired probes into results.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::probe::{Probe, ProbeResult};

/// How often an idle handler re-checks cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Compute the fate of a single probe.
///
/// `recv_ns == 0` means the probe expired unreceived. An inverted pair of
/// stamps means the clock went backwards or the payload was corrupt;
/// either way the sample is unusable and counts as loss.
pub fn process(probe: &Probe) -> ProbeResult {
    let mut result = ProbeResult {
        path: probe.path.clone(),
        rtt_ns: 0,
        done_ns: probe.recv_ns,
        lost: false,
    };
    if probe.recv_ns == 0 {
        result.lost = true;
    } else if probe.sent_ns > probe.recv_ns {
        warn!(
            sent_ns = probe.sent_ns,
            recv_ns = probe.recv_ns,
            "probe timestamps out of order, counting as loss"
        );
        result.lost = true;
    } else {
        result.rtt_ns = probe.recv_ns - probe.sent_ns;
    }
    result
}

/// A worker draining the shared completed-probe channel. Several handlers
/// may run against the same channel; ordering between them is not
/// preserved and does not matter downstream.
pub struct ResultHandler {
    inp: Receiver<Probe>,
    out: Sender<ProbeResult>,
    cancel: CancellationToken,
}

impl ResultHandler {
    pub fn new(inp: Receiver<Probe>, out: Sender<ProbeResult>, cancel: CancellationToken) -> Self {
        Self { inp, out, cancel }
    }

    /// Run on a dedicated thread until cancelled or the pipeline closes.
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    fn run(self) {
        loop {
            match self.inp.recv_timeout(POLL_INTERVAL) {
                Ok(probe) => {
                    if self.out.send(process(&probe)).is_err() {
                        debug!("result channel closed, handler exiting");
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        debug!("result handler stopped");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("probe channel closed, handler exiting");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::PathDist;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn probe(sent_ns: u64, recv_ns: u64) -> Probe {
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1000);
        let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2000);
        Probe {
            path: PathDist::new(src, dst),
            tos: 0,
            sent_ns,
            recv_ns,
        }
    }

    #[test]
    fn received_probe_yields_rtt() {
        let result = process(&probe(100_000, 200_000));
        assert_eq!(result.rtt_ns, 100_000);
        assert_eq!(result.done_ns, 200_000);
        assert!(!result.lost);
    }

    #[test]
    fn unreceived_probe_is_lost_with_zero_rtt() {
        let result = process(&probe(100_000, 0));
        assert_eq!(result.rtt_ns, 0);
        assert!(result.lost);
    }

    #[test]
    fn inverted_timestamps_are_lost() {
        let result = process(&probe(200_000, 100_000));
        assert_eq!(result.rtt_ns, 0);
        assert!(result.lost);
    }

    #[test]
    fn equal_timestamps_are_a_zero_rtt_success() {
        let result = process(&probe(100_000, 100_000));
        assert_eq!(result.rtt_ns, 0);
        assert!(!result.lost);
    }

    #[test]
    fn handler_drains_probes_into_results() {
        let (probe_tx, probe_rx) = crossbeam_channel::bounded(8);
        let (result_tx, result_rx) = crossbeam_channel::bounded(8);
        let cancel = CancellationToken::new();
        let handle = ResultHandler::new(probe_rx, result_tx, cancel.clone()).spawn();

        probe_tx.send(probe(10, 30)).unwrap();
        probe_tx.send(probe(10, 0)).unwrap();

        let first = result_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = result_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.rtt_ns, 20);
        assert!(second.lost);

        cancel.cancel();
        handle.join().unwrap();
    }
}
