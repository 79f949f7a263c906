//! Cluster map: the versioned set of storage targets.

use parking_lot::RwLock;
use scatterio_common::TargetId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One storage target as known to the cluster map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,
    /// Wire address, opaque to placement (`host:port` for the TCP link).
    pub addr: String,
}

impl TargetInfo {
    #[must_use]
    pub fn new(id: TargetId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// A versioned snapshot of the cluster membership.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    targets: BTreeMap<TargetId, TargetInfo>,
}

impl Smap {
    #[must_use]
    pub fn new(version: u64) -> Self {
        Self {
            version,
            targets: BTreeMap::new(),
        }
    }

    pub fn upsert(&mut self, target: TargetInfo) {
        self.targets.insert(target.id, target);
    }

    pub fn remove(&mut self, id: &TargetId) -> Option<TargetInfo> {
        self.targets.remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &TargetId) -> Option<&TargetInfo> {
        self.targets.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &TargetId) -> bool {
        self.targets.contains_key(id)
    }

    /// Number of active targets.
    #[must_use]
    pub fn count(&self) -> usize {
        self.targets.len()
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetInfo> {
        self.targets.values()
    }

    /// All target ids except `me`, in map order.
    #[must_use]
    pub fn peers(&self, me: &TargetId) -> Vec<TargetId> {
        self.targets.keys().filter(|id| *id != me).copied().collect()
    }
}

/// Shared, swappable view of the current cluster map.
///
/// The engine snapshots the map once per operation; a concurrent map change
/// never tears an in-flight placement computation.
#[derive(Clone, Debug, Default)]
pub struct SmapView {
    inner: Arc<RwLock<Arc<Smap>>>,
}

impl SmapView {
    #[must_use]
    pub fn new(smap: Smap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(smap))),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<Smap> {
        Arc::clone(&self.inner.read())
    }

    /// Install a new map version.
    pub fn store(&self, smap: Smap) {
        *self.inner.write() = Arc::new(smap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut smap = Smap::new(3);
        let a = TargetId::new();
        let b = TargetId::new();
        smap.upsert(TargetInfo::new(a, "h1:9000"));
        smap.upsert(TargetInfo::new(b, "h2:9000"));

        assert_eq!(smap.count(), 2);
        assert!(smap.contains(&a));
        assert_eq!(smap.peers(&a), vec![b]);
    }

    #[test]
    fn test_view_swap() {
        let view = SmapView::new(Smap::new(1));
        let snap = view.load();
        assert_eq!(snap.version, 1);

        view.store(Smap::new(2));
        assert_eq!(view.load().version, 2);
        // Old snapshot is unaffected.
        assert_eq!(snap.version, 1);
    }
}
