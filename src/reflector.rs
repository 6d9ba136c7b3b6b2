//! Reflector: echoes probe datagrams back to their sender with the
//! requested ToS marking.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use socket2::Socket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::ratelimit::RateLimiter;
use crate::socket;
use crate::wire;

/// Default port reflectors listen on.
pub const DEFAULT_REFLECTOR_PORT: u16 = 8100;

/// A single-socket echo loop.
///
/// The socket's ToS byte is updated in place when a probe requests a
/// different marking, which assumes exclusive control: run one reflector
/// per socket, never several.
pub struct Reflector {
    sock: Socket,
    local: SocketAddr,
    ipv6: bool,
    limiter: RateLimiter,
    cancel: CancellationToken,
}

impl Reflector {
    /// Bind the echo socket. `pps` caps how many datagrams per second are
    /// reflected.
    pub fn bind(
        bind: SocketAddr,
        pps: f64,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let sock = socket::bind_udp(bind, 0, read_timeout)?;
        let local = socket::local_addr(&sock)?;
        Ok(Self {
            sock,
            local,
            ipv6: bind.is_ipv6(),
            limiter: RateLimiter::new(pps),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Run the echo loop on the calling thread until cancelled.
    pub fn run(self) {
        let mut buf = [0u8; 4096];
        let mut current_tos = 0u8;
        info!(local = %self.local, "beginning reflection");

        loop {
            if self.cancel.is_cancelled() {
                info!(local = %self.local, "reflector stopped");
                return;
            }
            // Pace before the read so a flood cannot outrun the limiter.
            self.limiter.acquire_blocking();

            let (len, peer) = match socket::recv_from(&self.sock, &mut buf) {
                Ok(received) => received,
                Err(e) if socket::is_timeout(&e) => continue,
                Err(e) => {
                    warn!(local = %self.local, error = %e, "reflector receive failed");
                    continue;
                }
            };

            // Only probe payloads are reflected; anything else is noise.
            let probe = match wire::decode_any(&buf[..len]) {
                Ok(probe) => probe,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "ignoring non-probe datagram");
                    continue;
                }
            };

            // Retag the socket before replying so the echo carries the
            // marking the collector asked for.
            if probe.tos != current_tos {
                match socket::set_tos(&self.sock, probe.tos, self.ipv6) {
                    Ok(()) => current_tos = probe.tos,
                    Err(e) => warn!(tos = probe.tos, error = %e, "failed to set ToS"),
                }
            }

            if let Err(e) = socket::send_to(&self.sock, &buf[..len], peer) {
                warn!(peer = %peer, error = %e, "echo send failed");
            }
        }
    }

    /// Run the echo loop on a dedicated OS thread.
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }
}
