//! Integration tests for the probe→reflect→summarize pipeline.
//!
//! Everything runs over loopback sockets: a real reflector echoes real
//! probes, and results flow through the same channels the collector wires
//! up in production.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use netpulse::collector::handler::ResultHandler;
use netpulse::collector::ratelimit::RateLimiter;
use netpulse::collector::runner::TestRunner;
use netpulse::collector::summary::{bucket_key, summarize_set, Summarizer};
use netpulse::collector::DEFAULT_CHANNEL_SIZE;
use netpulse::probe::{Probe, ProbeResult};
use netpulse::reflector::Reflector;

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// Build a runner with one port and the given timeouts, pointed at `target`.
fn runner_for(
    cbc: crossbeam_channel::Sender<Probe>,
    cancel: CancellationToken,
    target: SocketAddr,
    cps: f64,
    timeout: Duration,
) -> TestRunner {
    let mut runner = TestRunner::new(cbc, RateLimiter::new(cps), cancel);
    runner
        .add_port(loopback(), 0, timeout, timeout / 2, Duration::from_millis(20))
        .expect("port bind");
    runner.targets().set(vec![target]);
    runner
}

#[tokio::test(flavor = "multi_thread")]
async fn probes_echoed_by_a_reflector_become_rtt_results() {
    let cancel = CancellationToken::new();

    let reflector = Reflector::bind(
        loopback(),
        10_000.0,
        Duration::from_millis(20),
        cancel.clone(),
    )
    .expect("reflector bind");
    let reflector_addr = reflector.local_addr();
    let reflector_thread = reflector.spawn();

    let (cbc_tx, cbc_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
    let (results_tx, results_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
    let handler = ResultHandler::new(cbc_rx, results_tx, cancel.clone()).spawn();

    let runner = runner_for(
        cbc_tx,
        cancel.clone(),
        reflector_addr,
        10.0,
        Duration::from_secs(2),
    );
    let runner_handle = runner.run();

    let result = results_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("a completed result should arrive");
    assert!(!result.lost, "loopback echo should not be lost");
    assert!(result.rtt_ns > 0);
    assert!(result.done_ns > 0);
    assert_eq!(result.path.dst_ip, reflector_addr.ip());
    assert_eq!(result.path.dst_port, reflector_addr.port());
    assert!(result.path.src_ip.is_loopback());

    cancel.cancel();
    runner_handle.cycle_task.await.unwrap();
    runner_handle.group.mux_task.await.unwrap();
    for port in runner_handle.group.ports {
        port.send_task.await.unwrap();
        port.recv_thread.join().unwrap();
    }
    handler.join().unwrap();
    reflector_thread.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_targets_become_loss_results() {
    let cancel = CancellationToken::new();

    // A bound socket that never replies.
    let silent = netpulse::socket::bind_udp(loopback(), 0, Duration::from_millis(500))
        .expect("silent socket");
    let silent_addr = netpulse::socket::local_addr(&silent).expect("silent addr");

    let (cbc_tx, cbc_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
    let (results_tx, results_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
    let handler = ResultHandler::new(cbc_rx, results_tx, cancel.clone()).spawn();

    let runner = runner_for(
        cbc_tx,
        cancel.clone(),
        silent_addr,
        5.0,
        Duration::from_millis(200),
    );
    let runner_handle = runner.run();

    let result = results_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("an expired result should arrive");
    assert!(result.lost);
    assert_eq!(result.rtt_ns, 0);
    assert_eq!(result.path.dst_ip, silent_addr.ip());

    cancel.cancel();
    runner_handle.cycle_task.await.unwrap();
    runner_handle.group.mux_task.await.unwrap();
    for port in runner_handle.group.ports {
        port.send_task.await.unwrap();
        port.recv_thread.join().unwrap();
    }
    handler.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn two_port_group_probes_every_path() {
    let cancel = CancellationToken::new();

    let reflector = Reflector::bind(
        loopback(),
        10_000.0,
        Duration::from_millis(20),
        cancel.clone(),
    )
    .expect("reflector bind");
    let reflector_addr = reflector.local_addr();
    let reflector_thread = reflector.spawn();

    let (cbc_tx, cbc_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
    let (results_tx, results_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);
    let handler = ResultHandler::new(cbc_rx, results_tx, cancel.clone()).spawn();

    let timeout = Duration::from_secs(2);
    let mut runner = TestRunner::new(cbc_tx, RateLimiter::new(10.0), cancel.clone());
    for _ in 0..2 {
        runner
            .add_port(loopback(), 0, timeout, timeout / 2, Duration::from_millis(20))
            .expect("port bind");
    }
    runner.targets().set(vec![reflector_addr]);
    let runner_handle = runner.run();

    // Each cycle fans the one target out to both ports, so completed
    // results arrive from two distinct source ports.
    let mut src_ports = std::collections::HashSet::new();
    for _ in 0..8 {
        let result = results_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("results from both ports");
        assert!(!result.lost);
        src_ports.insert(result.path.src_port);
        if src_ports.len() == 2 {
            break;
        }
    }
    assert_eq!(src_ports.len(), 2, "both ports should complete probes");

    cancel.cancel();
    runner_handle.cycle_task.await.unwrap();
    runner_handle.group.mux_task.await.unwrap();
    for port in runner_handle.group.ports {
        port.send_task.await.unwrap();
        port.recv_thread.join().unwrap();
    }
    handler.join().unwrap();
    reflector_thread.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn summarizer_publishes_windowed_stats_from_live_results() {
    let cancel = CancellationToken::new();
    let (results_tx, results_rx) = crossbeam_channel::bounded(DEFAULT_CHANNEL_SIZE);

    let summarizer = Summarizer::new(results_rx, Duration::from_secs(1), 2, cancel.clone());
    let cache = summarizer.cache();
    let handle = summarizer.run();

    let path = netpulse::probe::PathDist::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 8100),
    );
    for rtt_ns in [1_000_000u64, 2_000_000, 3_000_000] {
        results_tx
            .send(ProbeResult {
                path: path.clone(),
                rtt_ns,
                done_ns: rtt_ns,
                lost: false,
            })
            .unwrap();
    }
    results_tx
        .send(ProbeResult {
            path: path.clone(),
            rtt_ns: 0,
            done_ns: 0,
            lost: true,
        })
        .unwrap();

    // Alignment can consume up to one interval, then one more to tick;
    // poll fast enough to observe the window before the next (empty) one
    // replaces it.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let summaries = loop {
        let snapshot = cache.snapshot();
        if !snapshot.is_empty() {
            break snapshot;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "summarizer never published"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.sent, 4);
    assert_eq!(summary.lost, 1);
    assert_eq!(summary.loss_pct, 25.0);
    assert_eq!(summary.rtt_avg, 2.0);
    assert_eq!(summary.rtt_min, 1.0);
    assert_eq!(summary.rtt_max, 3.0);

    cancel.cancel();
    handle.tick_task.await.unwrap();
    for thread in handle.store_threads {
        thread.join().unwrap();
    }
}

#[test]
fn summaries_group_by_source_destination_pair() {
    let src_a = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1111);
    let src_b = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2222);
    let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 8100);

    let key_a = bucket_key(&netpulse::probe::PathDist::new(src_a, dst));
    let key_b = bucket_key(&netpulse::probe::PathDist::new(src_b, dst));
    assert_eq!(key_a, key_b, "port differences must not split buckets");

    let summary = summarize_set(&[ProbeResult {
        path: netpulse::probe::PathDist::new(src_a, dst),
        rtt_ns: 4_000_000,
        done_ns: 4_000_000,
        lost: false,
    }])
    .unwrap();
    assert_eq!(summary.path.dst_ip, dst.ip());
    assert_eq!(summary.rtt_avg, 4.0);
}
