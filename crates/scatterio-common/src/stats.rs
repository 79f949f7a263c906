//! Engine counters.
//!
//! Cheap atomics bumped from hot paths; a consistent-enough snapshot is
//! available for logging and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters maintained by the put/get schedulers and the responder.
#[derive(Debug, Default)]
pub struct EcStats {
    /// Objects encoded or restored.
    pub objects: AtomicU64,
    /// Payload bytes moved (encoded, restored, or served to peers).
    pub bytes: AtomicU64,
    pub encode_time_us: AtomicU64,
    pub decode_time_us: AtomicU64,
    pub delete_time_us: AtomicU64,
    /// Time spent blocked on peers (metadata gather, slice fetch).
    pub wait_time_us: AtomicU64,
    pub errors: AtomicU64,
}

impl EcStats {
    pub fn add_object(&self, bytes: u64) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_encode_time(&self, d: Duration) {
        self.encode_time_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_decode_time(&self, d: Duration) {
        self.decode_time_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_delete_time(&self, d: Duration) {
        self.delete_time_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_wait_time(&self, d: Duration) {
        self.wait_time_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects: self.objects.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            encode_time_us: self.encode_time_us.load(Ordering::Relaxed),
            decode_time_us: self.decode_time_us.load(Ordering::Relaxed),
            delete_time_us: self.delete_time_us.load(Ordering::Relaxed),
            wait_time_us: self.wait_time_us.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EcStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub objects: u64,
    pub bytes: u64,
    pub encode_time_us: u64,
    pub decode_time_us: u64,
    pub delete_time_us: u64,
    pub wait_time_us: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = EcStats::default();
        stats.add_object(100);
        stats.add_object(50);
        stats.add_encode_time(Duration::from_micros(250));

        let snap = stats.snapshot();
        assert_eq!(snap.objects, 2);
        assert_eq!(snap.bytes, 150);
        assert_eq!(snap.encode_time_us, 250);
    }
}
