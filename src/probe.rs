//! Core measurement types shared across the probe pipeline.
//!
//! A [`Probe`] is the in-memory record of one UDP datagram sent toward a
//! reflector; a [`ProbeResult`] is its post-processed fate. Both carry the
//! [`PathDist`] identifying the directed flow they traveled.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Number of opaque ID bytes naming an outstanding probe.
pub const SIGNATURE_LEN: usize = 10;

/// Transport used by a probe. UDP is the only probe transport today; the
/// field is kept on [`PathDist`] so flows stay distinguishable if that
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Path distinguisher: the tuple that determines path selection for a
/// directed flow. Summarization keys on `(src_ip, dst_ip)` only; ports and
/// protocol are retained for later use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathDist {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub proto: Protocol,
}

impl PathDist {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src_ip: src.ip(),
            src_port: src.port(),
            dst_ip: dst.ip(),
            dst_port: dst.port(),
            proto: Protocol::Udp,
        }
    }
}

/// Opaque 10-byte probe ID, unique within a cache TTL window with
/// overwhelming probability.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    /// Generate a fresh signature from the trailing bytes of a random
    /// 128-bit identifier.
    pub fn generate() -> Self {
        let id = Uuid::new_v4();
        let bytes = id.as_bytes();
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&bytes[bytes.len() - SIGNATURE_LEN..]);
        Self(sig)
    }

    /// Build a signature from a wire slice; `None` if the length is wrong.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; SIGNATURE_LEN] = data.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl From<[u8; SIGNATURE_LEN]> for Signature {
    fn from(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A single UDP probe sent from, and hopefully received back on, a Port.
///
/// `recv_ns` stays 0 until the echo is matched; a probe evicted with
/// `recv_ns == 0` timed out and counts as loss.
#[derive(Debug, Clone)]
pub struct Probe {
    pub path: PathDist,
    pub tos: u8,
    pub sent_ns: u64,
    pub recv_ns: u64,
}

/// The fate of a single completed probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub path: PathDist,
    /// Round trip time in nanoseconds; 0 when lost.
    pub rtt_ns: u64,
    /// When the probe completed (was received back) in wall-clock ns.
    pub done_ns: u64,
    /// True when the probe expired unreceived or its timestamps were
    /// inverted.
    pub lost: bool,
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
///
/// Wall clock rather than monotonic because the value crosses the wire;
/// RTT math only ever uses the difference of two local stamps.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
