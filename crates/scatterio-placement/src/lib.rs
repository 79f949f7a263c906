//! ScatterIO placement — the cluster map and the deterministic slice
//! placement function.
//!
//! Placement is a rendezvous hash: every target scores `xxh64(uname)` keyed
//! by its own id, and the ordered score list is the placement order. The
//! first entry is the object's *main* target; slice *i* (1-indexed, after the
//! main replica) lives on entry *i*. Recomputing after a cluster-map change
//! may reshuffle the order; artifacts found off their computed target are
//! misplaced but still valid as long as their sidecar says so.

pub mod smap;

pub use smap::{Smap, SmapView, TargetInfo};

use scatterio_common::TargetId;
use xxhash_rust::xxh64::xxh64;

/// Deterministic placement order for `uname`, truncated to `k` targets.
///
/// Returns fewer than `k` entries when the map holds fewer targets; callers
/// enforce their own minimums (`INSUFFICIENT_TARGETS` at the scheduler
/// pre-flight).
#[must_use]
pub fn place(uname: &str, smap: &Smap, k: usize) -> Vec<TargetId> {
    let mut scored: Vec<(u64, TargetId)> = smap
        .targets()
        .map(|t| {
            let seed = xxh64(t.id.as_bytes(), 0);
            (xxh64(uname.as_bytes(), seed), t.id)
        })
        .collect();

    // Highest score wins; target id breaks the (astronomically unlikely) tie
    // deterministically.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}

/// The main target for an object: the head of the placement order.
#[must_use]
pub fn main_target(uname: &str, smap: &Smap) -> Option<TargetId> {
    place(uname, smap, 1).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smap_with(n: usize) -> Smap {
        let mut smap = Smap::new(1);
        for i in 0..n {
            let mut bytes = [0u8; 16];
            bytes[0] = i as u8 + 1;
            smap.upsert(TargetInfo::new(
                TargetId::from_bytes(bytes),
                format!("127.0.0.1:{}", 9000 + i),
            ));
        }
        smap
    }

    #[test]
    fn test_deterministic() {
        let smap = smap_with(7);
        let a = place("bck/obj-1", &smap, 7);
        let b = place("bck/obj-1", &smap, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn test_truncation_and_prefix_stability() {
        let smap = smap_with(7);
        let full = place("bck/obj-2", &smap, 7);
        let head = place("bck/obj-2", &smap, 3);
        assert_eq!(&full[..3], &head[..]);
    }

    #[test]
    fn test_distinct_targets() {
        let smap = smap_with(10);
        let order = place("bck/obj-3", &smap, 10);
        let unique: std::collections::HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_spread_across_objects() {
        // Different objects should not all pick the same main target.
        let smap = smap_with(8);
        let mains: std::collections::HashSet<_> = (0..64)
            .map(|i| main_target(&format!("bck/obj-{i}"), &smap).unwrap())
            .collect();
        assert!(mains.len() > 1);
    }

    #[test]
    fn test_fewer_targets_than_k() {
        let smap = smap_with(2);
        assert_eq!(place("bck/obj", &smap, 5).len(), 2);
    }
}
