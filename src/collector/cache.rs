//! Keyed probe store with per-entry TTL and an eviction sink.
//!
//! The cache does double duty: it bounds how much per-probe state a Port
//! holds, and it turns silence into a loss event. Both the received path
//! (`expire_now`) and the timed-out path (`sweep`) deliver the probe to a
//! single sink, so the Port has exactly one output contract.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::probe::{Probe, Signature};

struct Entry {
    probe: Probe,
    expires_at: Instant,
}

/// TTL-indexed `signature → Probe` store.
///
/// Every probe inserted is eventually delivered to the sink exactly once:
/// either updated via [`ProbeCache::expire_now`] on receipt, or unchanged
/// (with `recv_ns == 0`) when a sweep finds it past its TTL. Entries are
/// removed under the lock before delivery, so the two paths cannot race
/// into a double emission.
pub struct ProbeCache {
    ttl: Duration,
    entries: Mutex<HashMap<Signature, Entry>>,
    // None after shutdown: evictions are discarded instead of reported as
    // loss. Swapping to None is always safe; there is no callback to race.
    sink: RwLock<Option<Sender<Probe>>>,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            sink: RwLock::new(None),
        }
    }

    /// Install the eviction sink. Called once during Port construction.
    pub fn set_sink(&self, sink: Sender<Probe>) {
        *self.sink.write() = Some(sink);
    }

    /// Disconnect the sink. Outstanding probes will expire silently, which
    /// keeps a shutdown from inflating loss statistics.
    pub fn clear_sink(&self) {
        *self.sink.write() = None;
    }

    /// Insert a probe under its signature with the default TTL.
    pub fn set(&self, signature: Signature, probe: Probe) {
        let entry = Entry {
            probe,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().insert(signature, entry);
    }

    /// Non-consuming lookup.
    pub fn get(&self, signature: &Signature) -> Option<Probe> {
        self.entries
            .lock()
            .get(signature)
            .map(|entry| entry.probe.clone())
    }

    /// Replace the entry with `probe` and evict it immediately, delivering
    /// the updated probe to the sink. Returns false when the signature had
    /// already expired (nothing is delivered).
    pub fn expire_now(&self, signature: Signature, probe: Probe) -> bool {
        let removed = self.entries.lock().remove(&signature).is_some();
        if removed {
            self.emit(probe);
        }
        removed
    }

    /// Remove every entry past its TTL and deliver each to the sink.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<Probe> = {
            let mut entries = self.entries.lock();
            let dead: Vec<Signature> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(sig, _)| *sig)
                .collect();
            dead.into_iter()
                .filter_map(|sig| entries.remove(&sig))
                .map(|entry| entry.probe)
                .collect()
        };
        for probe in expired {
            self.emit(probe);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn emit(&self, probe: Probe) {
        // Clone the sender out of the lock: delivery may block on a full
        // channel and must not hold the sink lock while it does.
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            let _ = sink.send(probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{now_ns, PathDist};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::thread::sleep;

    fn probe() -> Probe {
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1000);
        let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2000);
        Probe {
            path: PathDist::new(src, dst),
            tos: 0,
            sent_ns: now_ns(),
            recv_ns: 0,
        }
    }

    #[test]
    fn set_then_get() {
        let cache = ProbeCache::new(Duration::from_secs(2));
        let sig = Signature::generate();
        cache.set(sig, probe());
        assert!(cache.get(&sig).is_some());
        assert!(cache.get(&Signature::generate()).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expire_now_delivers_updated_probe_once() {
        let cache = ProbeCache::new(Duration::from_secs(2));
        let (tx, rx) = crossbeam_channel::bounded(4);
        cache.set_sink(tx);

        let sig = Signature::generate();
        cache.set(sig, probe());

        let mut updated = cache.get(&sig).unwrap();
        updated.recv_ns = updated.sent_ns + 500;
        assert!(cache.expire_now(sig, updated));

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.recv_ns, delivered.sent_ns + 500);
        assert!(rx.try_recv().is_err());
        assert!(cache.is_empty());

        // A second expiry for the same signature delivers nothing.
        assert!(!cache.expire_now(sig, delivered));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sweep_delivers_expired_entries_with_zero_recv() {
        let cache = ProbeCache::new(Duration::from_millis(10));
        let (tx, rx) = crossbeam_channel::bounded(4);
        cache.set_sink(tx);

        cache.set(Signature::generate(), probe());
        cache.set(Signature::generate(), probe());
        sleep(Duration::from_millis(25));
        cache.sweep();

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(a.recv_ns, 0);
        assert_eq!(b.recv_ns, 0);
        assert!(rx.try_recv().is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_leaves_fresh_entries_alone() {
        let cache = ProbeCache::new(Duration::from_secs(10));
        let (tx, rx) = crossbeam_channel::bounded(4);
        cache.set_sink(tx);

        cache.set(Signature::generate(), probe());
        cache.sweep();

        assert_eq!(cache.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cleared_sink_discards_evictions() {
        let cache = ProbeCache::new(Duration::from_millis(1));
        let (tx, rx) = crossbeam_channel::bounded(4);
        cache.set_sink(tx);
        cache.clear_sink();

        let sig = Signature::generate();
        cache.set(sig, probe());
        sleep(Duration::from_millis(5));
        cache.sweep();

        assert!(cache.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
