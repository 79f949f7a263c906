//! Crash-recovery scan.
//!
//! The engine persists nothing but content files and their sidecars, so
//! recovery is a directory walk: index the sidecars, drop payload files that
//! lack one, drop sidecars whose bucket generation no longer matches, and
//! clear leftover scratch files.

use crate::meta::SliceMeta;
use scatterio_common::Result;
use scatterio_fs::{ContentType, Mountpath};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Counts from one scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrubReport {
    /// Replica/slice files removed for lacking a sidecar.
    pub orphans_removed: usize,
    /// Sidecars (plus their payloads) removed for a stale or unreadable
    /// state.
    pub stale_removed: usize,
    /// Scratch files cleared.
    pub workfiles_removed: usize,
}

impl ScrubReport {
    pub fn merge(&mut self, other: Self) {
        self.orphans_removed += other.orphans_removed;
        self.stale_removed += other.stale_removed;
        self.workfiles_removed += other.workfiles_removed;
    }
}

/// Scan one mountpath. `live_buckets` maps bucket name to its current
/// generation id; sidecars recorded under an older generation are stale.
pub fn scrub_mountpath(
    mp: &Mountpath,
    live_buckets: &HashMap<String, u64>,
) -> Result<ScrubReport> {
    let mut report = ScrubReport::default();

    for bucket in mp.list_buckets()? {
        let mut valid: HashSet<String> = HashSet::new();

        for name in mp.list_content(&bucket, ContentType::Meta)? {
            let keep = match SliceMeta::load(mp, &bucket, &name) {
                Ok(Some(md)) => match live_buckets.get(&bucket) {
                    Some(live_id) => md.bucket_id == *live_id,
                    // Bucket unknown to the cluster: everything is stale.
                    None => false,
                },
                Ok(None) => false,
                Err(e) => {
                    warn!(%bucket, %name, error = %e, "unreadable sidecar, dropping");
                    false
                }
            };

            if keep {
                valid.insert(name);
            } else {
                report.stale_removed += 1;
                for ct in [ContentType::Meta, ContentType::Replica, ContentType::Slice] {
                    if let Err(e) = mp.remove(&bucket, ct, &name) {
                        warn!(%bucket, %name, %ct, error = %e, "stale cleanup failed");
                    }
                }
            }
        }

        for ct in [ContentType::Replica, ContentType::Slice] {
            for name in mp.list_content(&bucket, ct)? {
                if valid.contains(&name) {
                    continue;
                }
                debug!(%bucket, %name, %ct, "removing orphan payload");
                if mp.remove(&bucket, ct, &name)? {
                    report.orphans_removed += 1;
                }
            }
        }

        for name in mp.list_content(&bucket, ContentType::Work)? {
            if mp.remove(&bucket, ContentType::Work, &name)? {
                report.workfiles_removed += 1;
            }
        }
    }

    Ok(report)
}
