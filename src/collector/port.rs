//! A Port owns one UDP socket and the probe cache tracking its in-flight
//! probes.
//!
//! Two loops per Port: an async send loop draining the target input
//! channel, and a blocking receive thread matching echoes back to cache
//! entries. The receive thread doubles as the cache sweeper, converting
//! unreturned probes into loss on the `clean_rate` cadence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Sender;
use socket2::Socket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::collector::cache::ProbeCache;
use crate::probe::{now_ns, PathDist, Probe, Signature};
use crate::socket;
use crate::wire;

/// How long a receive blocks before re-checking cancellation. Without this
/// pump a stopped Port could sit in the kernel forever.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);
/// How long a probe counts as outstanding before it becomes loss.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(2);
/// Cadence of the sweep that turns expired cache entries into results.
pub const DEFAULT_CLEAN_RATE: Duration = Duration::from_secs(5);

struct PortInner {
    socket: Socket,
    local: SocketAddr,
    tos: u8,
    cache: ProbeCache,
    read_timeout: Duration,
    clean_rate: Duration,
    cancel: CancellationToken,
}

/// One probe socket with its cache and control wiring. Built idle; the
/// loops start when [`Port::spawn`] is called by the owning group.
pub struct Port {
    inner: Arc<PortInner>,
}

/// Join handles for a running Port's two loops.
pub struct PortHandle {
    pub send_task: tokio::task::JoinHandle<()>,
    pub recv_thread: std::thread::JoinHandle<()>,
}

impl Port {
    /// Bind a socket and prepare the cache. The eviction sink (`cbc`) is
    /// installed here so probes expiring before the loops start are still
    /// accounted.
    pub fn bind(
        bind: SocketAddr,
        tos: u8,
        cache_timeout: Duration,
        clean_rate: Duration,
        read_timeout: Duration,
        cbc: Sender<Probe>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = socket::bind_udp(bind, tos, read_timeout)?;
        let local = socket::local_addr(&socket)?;
        let cache = ProbeCache::new(cache_timeout);
        cache.set_sink(cbc);
        Ok(Self {
            inner: Arc::new(PortInner {
                socket,
                local,
                tos,
                cache,
                read_timeout,
                clean_rate,
                cancel,
            }),
        })
    }

    /// Address the socket is bound to; the source side of every PathDist
    /// this Port produces.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// ToS byte probes from this Port carry. Fixed at configuration time
    /// for collector ports.
    pub fn tos(&self) -> u8 {
        self.inner.tos
    }

    /// Start the send loop and the receive thread, consuming the Port.
    pub fn spawn(self, input: mpsc::Receiver<SocketAddr>) -> PortHandle {
        let send_inner = Arc::clone(&self.inner);
        let recv_inner = Arc::clone(&self.inner);
        PortHandle {
            send_task: tokio::spawn(send_loop(send_inner, input)),
            recv_thread: std::thread::spawn(move || recv_loop(recv_inner)),
        }
    }
}

/// Drain target addresses and emit one probe per address.
///
/// The cache insert happens before the send syscall, so a matched echo can
/// never observe a missing entry for its own signature.
async fn send_loop(inner: Arc<PortInner>, mut input: mpsc::Receiver<SocketAddr>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!(local = %inner.local, "port send loop stopped");
                return;
            }
            addr = input.recv() => {
                let Some(addr) = addr else {
                    debug!(local = %inner.local, "port input channel closed");
                    return;
                };
                let signature = Signature::generate();
                let sent_ns = now_ns();
                let probe = Probe {
                    path: PathDist::new(inner.local, addr),
                    tos: inner.tos,
                    sent_ns,
                    recv_ns: 0,
                };
                inner.cache.set(signature, probe);
                let frame = wire::WireProbe::new(signature, inner.tos, sent_ns).encode();
                if let Err(e) = socket::send_to(&inner.socket, &frame, addr) {
                    // Transient conditions (ENOBUFS, unreachable) are not
                    // worth a dead Port; the probe will age out as loss.
                    warn!(local = %inner.local, dst = %addr, error = %e, "probe send failed");
                }
            }
        }
    }
}

/// Match echoes back to cache entries and run the TTL sweep.
fn recv_loop(inner: Arc<PortInner>) {
    let mut buf = [0u8; 4096];
    let mut last_sweep = Instant::now();

    loop {
        if inner.cancel.is_cancelled() {
            // Outstanding probes expire silently from here on; reporting
            // them as loss would make every shutdown look like an outage.
            inner.cache.clear_sink();
            debug!(local = %inner.local, "port recv loop stopped");
            return;
        }

        match socket::recv_from(&inner.socket, &mut buf) {
            Ok((len, _from)) => match wire::decode_any(&buf[..len]) {
                Ok(echo) => {
                    if let Some(mut probe) = inner.cache.get(&echo.signature) {
                        probe.recv_ns = now_ns();
                        inner.cache.expire_now(echo.signature, probe);
                    }
                    // Unknown signature: the entry already aged out, the
                    // loss was recorded at expiry. Drop silently.
                }
                Err(e) => {
                    warn!(local = %inner.local, error = %e, "malformed probe payload dropped");
                }
            },
            Err(e) if socket::is_timeout(&e) => {
                // Deadline pump; falls through to the sweep check.
            }
            Err(e) => {
                if !inner.cancel.is_cancelled() {
                    error!(local = %inner.local, error = %e, "port receive failed, closing port");
                }
                inner.cache.clear_sink();
                return;
            }
        }

        if last_sweep.elapsed() >= inner.clean_rate {
            inner.cache.sweep();
            last_sweep = Instant::now();
        }
    }
}
