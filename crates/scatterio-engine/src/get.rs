//! Get scheduler: restore a missing or corrupt object from peers.
//!
//! Restore runs as a small state machine per object:
//!
//! ```text
//! NEW ─▶ META_GATHER ─▶ {REPLICA_FETCH | SLICE_FETCH}
//!                               │               │
//!                               ▼               ▼
//!                          CHECKSUM ───▶ RECONSTRUCT
//!                               │
//!                               ▼
//!                        PERSIST_LOCAL ─▶ REPAIR_PEERS ─▶ DONE
//! ```
//!
//! Phase 1 gathers metadata sidecars from every peer and majority-votes the
//! authoritative object checksum; disagreeing sidecars are logged and
//! discarded. Phase 2 either pulls a surviving full copy (replicated
//! objects) or pulls slices, drops the ones failing their checksum, and runs
//! the streaming reconstruct. The rebuilt replica is persisted before any
//! peer repair is dispatched; callers see either a whole object or a
//! terminal failure.

use crate::engine::{EngineInner, checksum_file, checksum_source};
use crate::meta::SliceMeta;
use bytes::Bytes;
use futures::future::join_all;
use scatterio_common::{Bck, Checksum, EcError, Result, TargetId, uname};
use scatterio_erasure::{FrozenSgl, Sgl, SliceSource, StreamCodec, slice_size_for};
use scatterio_fs::{ContentType, Mountpath};
use scatterio_placement::{Smap, place};
use scatterio_transport::{Incoming, RequestKind};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Work accepted by the get scheduler.
pub(crate) enum GetCmd {
    Restore {
        bck: Bck,
        name: String,
        done: oneshot::Sender<Result<()>>,
    },
}

/// Restore progress, for tracing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RestoreState {
    MetaGather,
    ReplicaFetch,
    SliceFetch,
    Checksum,
    Reconstruct,
    PersistLocal,
    RepairPeers,
    Done,
}

pub(crate) struct GetScheduler {
    inner: Arc<EngineInner>,
    mp: Arc<Mountpath>,
    rx: mpsc::UnboundedReceiver<GetCmd>,
    stop: watch::Receiver<bool>,
    gate: Arc<Semaphore>,
}

impl GetScheduler {
    pub fn new(
        inner: Arc<EngineInner>,
        mp: Arc<Mountpath>,
        rx: mpsc::UnboundedReceiver<GetCmd>,
        stop: watch::Receiver<bool>,
        parallelism: usize,
    ) -> Self {
        Self {
            inner,
            mp,
            rx,
            stop,
            gate: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    pub async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let GetCmd::Restore { bck, name, done } = cmd;
            let Ok(permit) = Arc::clone(&self.gate).acquire_owned().await else {
                break;
            };
            let inner = Arc::clone(&self.inner);
            let mp = Arc::clone(&self.mp);
            tokio::spawn(async move {
                let result = restore_object(inner.clone(), mp, bck, name).await;
                if let Err(e) = &result {
                    inner.stats.add_error();
                    warn!(error = %e, "restore failed");
                }
                let _ = done.send(result);
                drop(permit);
            });
        }
        debug!(mountpath = %self.mp.root().display(), "get scheduler stopped");
    }
}

/// Restore one object onto its owning mountpath.
pub(crate) async fn restore_object(
    inner: Arc<EngineInner>,
    mp: Arc<Mountpath>,
    bck: Bck,
    name: String,
) -> Result<()> {
    let uname = uname(&bck.name, &name);
    let _guard = inner.lock_object(&uname).await;
    let start = Instant::now();
    let mut state = RestoreState::MetaGather;
    debug!(%uname, ?state, "restore starting");

    let smap = inner.smap.load();
    let me = inner.me();
    let peers = smap.peers(&me);
    if peers.is_empty() {
        return Err(EcError::NoMetafile(uname));
    }

    // Phase 1 — gather metadata from every peer, bounded by the RPC timeout.
    let wait_start = Instant::now();
    let calls = peers.iter().map(|peer| {
        let inner = Arc::clone(&inner);
        let bck = bck.clone();
        let name = name.clone();
        let peer = *peer;
        async move {
            let header = inner.header(RequestKind::GetMd, &bck, &name);
            match inner.rpc.call(peer, header).await {
                Ok(reply) if !reply.header.meta.is_empty() => {
                    match SliceMeta::from_bytes(&reply.header.meta) {
                        Ok(md) => Some((peer, md)),
                        Err(e) => {
                            warn!(%peer, error = %e, "unparseable metadata sidecar");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    debug!(%peer, error = %e, "metadata fetch failed");
                    None
                }
            }
        }
    });
    let responses: Vec<(TargetId, SliceMeta)> =
        join_all(calls).await.into_iter().flatten().collect();
    inner.stats.add_wait_time(wait_start.elapsed());

    if responses.is_empty() {
        return Err(EcError::NoMetafile(uname));
    }

    // Majority vote on the object checksum; first seen wins a tie.
    let authoritative = majority(responses.iter().map(|(_, md)| md.obj_cksum.clone()))
        .ok_or_else(|| EcError::NoMetafile(uname.clone()))?;
    let kept: Vec<(TargetId, SliceMeta)> = responses
        .into_iter()
        .filter(|(peer, md)| {
            if md.obj_cksum == authoritative {
                true
            } else {
                warn!(%uname, %peer, theirs = %md.obj_cksum, ours = %authoritative,
                    "metadata disagrees with majority, discarding");
                false
            }
        })
        .collect();

    // Version propagation: the most frequent non-empty version wins.
    let version = majority(
        kept.iter()
            .map(|(_, md)| md.obj_version.clone())
            .filter(|v| !v.is_empty()),
    )
    .unwrap_or_default();

    let lead = kept[0].1.clone();
    let size = lead.size;

    if lead.is_copy {
        state = RestoreState::ReplicaFetch;
        debug!(%uname, ?state, "restoring from peer replicas");
        restore_from_replicas(
            &inner, &mp, &bck, &name, &kept, &authoritative, &version, &smap,
        )
        .await?;
    } else {
        state = RestoreState::SliceFetch;
        debug!(%uname, ?state, "restoring from slices");
        restore_from_slices(
            &inner, &mp, &bck, &name, &kept, &authoritative, &version, &smap, &lead,
        )
        .await?;
    }

    state = RestoreState::Done;
    debug!(%uname, ?state, elapsed = ?start.elapsed(), "restore complete");
    inner.stats.add_object(size);
    inner.stats.add_decode_time(start.elapsed());
    Ok(())
}

/// Count occurrences preserving first-seen order; strict-greater keeps the
/// earliest value on ties.
fn majority<T: PartialEq>(values: impl Iterator<Item = T>) -> Option<T> {
    let mut tally: Vec<(T, usize)> = Vec::new();
    for value in values {
        match tally.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }
    let mut best: Option<usize> = None;
    for (idx, (_, count)) in tally.iter().enumerate() {
        if best.is_none_or(|b| *count > tally[b].1) {
            best = Some(idx);
        }
    }
    best.map(|idx| tally.swap_remove(idx).0)
}

/// 4.2a — replicated objects: the first peer returning non-empty content
/// wins; missing copies are repaired in the background.
#[allow(clippy::too_many_arguments)]
async fn restore_from_replicas(
    inner: &Arc<EngineInner>,
    mp: &Arc<Mountpath>,
    bck: &Bck,
    name: &str,
    kept: &[(TargetId, SliceMeta)],
    authoritative: &Checksum,
    version: &str,
    smap: &Smap,
) -> Result<()> {
    let uname = uname(&bck.name, name);

    for (peer, md) in kept {
        let header = inner.header(RequestKind::GetReplica, bck, name);
        // A miss reply carries neither payload nor sidecar; a zero-size
        // object legitimately returns an empty payload with its sidecar.
        let reply = match inner.rpc.call(*peer, header).await {
            Ok(reply) if !reply.header.meta.is_empty() => reply,
            Ok(_) => continue,
            Err(e) => {
                debug!(%uname, %peer, error = %e, "replica fetch failed");
                continue;
            }
        };

        let payload = reply.payload;
        let ck = authoritative.clone();
        let verified = tokio::task::spawn_blocking(move || (ck.verify(&payload), payload))
            .await
            .map_err(|e| EcError::internal(e.to_string()))?;
        let (ok, payload) = verified;
        if !ok {
            warn!(%uname, %peer, "peer replica failed checksum, trying next");
            continue;
        }

        // Workfile, fsync, rename, then the sidecar.
        debug!(%uname, state = ?RestoreState::PersistLocal, "persisting fetched replica");
        let mut main_md = md.clone_for_copy();
        main_md.obj_version = version.to_string();
        {
            let mp = Arc::clone(mp);
            let bck_name = bck.name.clone();
            let name = name.to_string();
            let payload = payload.clone();
            let main_md = main_md.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let (work, mut file) = mp.create_workfile(&bck_name, &name)?;
                file.write_all(&payload)?;
                file.sync_all()?;
                drop(file);
                mp.rename_atomic(&work, &bck_name, ContentType::Replica, &name)?;
                main_md.store(&mp, &bck_name, &name)?;
                Ok(())
            })
            .await
            .map_err(|e| EcError::internal(e.to_string()))??;
        }

        // REPAIR_PEERS: push the replica to placement slots that answered
        // nothing in phase 1.
        let responders: HashSet<TargetId> = kept.iter().map(|(p, _)| *p).collect();
        let want = place(&uname, smap, md.parity as usize + 1);
        let meta_bytes = main_md.to_bytes()?;
        for target in want {
            if target == inner.me() || responders.contains(&target) {
                continue;
            }
            let mut header = inner.header(RequestKind::PutReplica, bck, name);
            header.size = payload.len() as u64;
            header.ck = Some(authoritative.clone());
            header.meta = meta_bytes.clone();
            debug!(%uname, %target, "repairing missing replica copy");
            inner.bundle.send(target, header, payload.clone(), None).await;
        }
        return Ok(());
    }

    Err(EcError::Timeout(format!(
        "replica restore for {uname}: exhausted responders"
    )))
}

/// 4.2b — encoded objects: fetch surviving slices, verify, reconstruct,
/// persist the replica, then repair peers missing their slice.
#[allow(clippy::too_many_arguments)]
async fn restore_from_slices(
    inner: &Arc<EngineInner>,
    mp: &Arc<Mountpath>,
    bck: &Bck,
    name: &str,
    kept: &[(TargetId, SliceMeta)],
    authoritative: &Checksum,
    version: &str,
    smap: &Smap,
    lead: &SliceMeta,
) -> Result<()> {
    let uname = uname(&bck.name, name);
    let data = lead.data as usize;
    let parity = lead.parity as usize;
    let total = data + parity;
    let slice_size = slice_size_for(lead.size, data);

    // Who holds which slice, per phase-1 metadata.
    let mut holders: Vec<Option<TargetId>> = vec![None; total + 1];
    for (peer, md) in kept {
        let id = md.slice_id as usize;
        if (1..=total).contains(&id) && holders[id].is_none() {
            holders[id] = Some(*peer);
        }
    }
    let have = holders.iter().flatten().count();
    if have < data {
        return Err(EcError::InsufficientSlices { have, need: data });
    }

    let required = slice_size * total as u64;
    let reservation = if bck.props.disk_only {
        None
    } else {
        inner.mem.try_reserve(required)
    };
    let disk_mode = reservation.is_none();

    // Request every surviving slice; replies route to our sink by
    // (peer, uname), correlated away from storage puts by the nonce.
    let nonce = inner.next_nonce();
    let (tx, mut rx) = mpsc::unbounded_channel::<Incoming>();
    let mut expected = 0usize;
    let queried: Vec<TargetId> = holders.iter().flatten().copied().collect();
    for peer in &queried {
        inner.register_sink(*peer, &uname, tx.clone());
    }
    for peer in &queried {
        let mut header = inner.header(RequestKind::GetSlice, bck, name);
        header.seq = nonce;
        inner.bundle.notify(*peer, header).await;
        expected += 1;
    }
    drop(tx);

    // Collect with the hard broadcast deadline; late or missing peers are
    // logged and tolerated.
    let wait_start = Instant::now();
    let deadline = wait_start + inner.cfg.send_file_time;
    let mut arrived: Vec<Option<(SliceMeta, Bytes)>> = (0..total).map(|_| None).collect();
    let mut got = 0usize;
    while got < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(%uname, got, expected, "slice fetch deadline reached");
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(frame)) => {
                got += 1;
                if frame.payload.is_empty() {
                    debug!(%uname, peer = %frame.header.sender, "peer reported slice missing");
                    continue;
                }
                match SliceMeta::from_bytes(&frame.header.meta) {
                    Ok(smd) if (1..=total).contains(&(smd.slice_id as usize)) => {
                        let idx = smd.slice_id as usize - 1;
                        if arrived[idx].is_none() {
                            arrived[idx] = Some((smd, frame.payload));
                        }
                    }
                    Ok(smd) => {
                        warn!(%uname, slice_id = smd.slice_id, "slice id out of range");
                    }
                    Err(e) => warn!(%uname, error = %e, "unparseable slice metadata"),
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!(%uname, got, expected, "slice fetch timed out");
                break;
            }
        }
    }
    for peer in &queried {
        inner.unregister_sink(*peer, &uname);
    }
    inner.stats.add_wait_time(wait_start.elapsed());

    // CHECKSUM: verify each arrived slice; a mismatch empties its slot.
    debug!(%uname, state = ?RestoreState::Checksum, "verifying arrived slices");
    let verified: Vec<Option<SliceSource>> = {
        let mp = Arc::clone(mp);
        let bck_name = bck.name.clone();
        let name = name.to_string();
        let uname = uname.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Option<SliceSource>>> {
            let mut out = Vec::with_capacity(arrived.len());
            for (idx, slot) in arrived.into_iter().enumerate() {
                let Some((smd, payload)) = slot else {
                    out.push(None);
                    continue;
                };
                if payload.len() as u64 != slice_size {
                    warn!(%uname, slice_id = idx + 1, "slice has wrong length, dropping");
                    out.push(None);
                    continue;
                }
                if let Some(ck) = &smd.slice_cksum {
                    if !ck.verify(&payload) {
                        warn!(%uname, slice_id = idx + 1, "slice failed checksum, dropping");
                        out.push(None);
                        continue;
                    }
                }
                let source = if disk_mode {
                    let (path, mut file) =
                        mp.create_workfile(&bck_name, &format!("{name}.s{}", idx + 1))?;
                    file.write_all(&payload)?;
                    file.sync_all()?;
                    drop(file);
                    SliceSource::workfile(path)
                } else {
                    SliceSource::sgl(FrozenSgl::from(payload))
                };
                out.push(Some(source));
            }
            Ok(out)
        })
        .await
        .map_err(|e| EcError::internal(e.to_string()))??
    };

    let have = verified.iter().flatten().count();
    if have < data {
        return Err(EcError::InsufficientSlices { have, need: data });
    }

    // RECONSTRUCT + PERSIST_LOCAL on the blocking pool.
    debug!(%uname, state = ?RestoreState::Reconstruct, missing = total - have, "rebuilding");
    let size = lead.size;
    let mut main_md = lead.clone();
    main_md.slice_id = 0;
    main_md.slice_cksum = None;
    main_md.is_copy = false;
    main_md.obj_cksum = authoritative.clone();
    main_md.obj_version = version.to_string();

    let (full_sources, rebuilt) = {
        let mp = Arc::clone(mp);
        let bck_name = bck.name.clone();
        let name = name.to_string();
        let uname = uname.clone();
        let authoritative = authoritative.clone();
        let main_md = main_md.clone();
        let codec = StreamCodec::new(data, parity).map_err(EcError::from)?;
        tokio::task::spawn_blocking(move || -> Result<(Vec<SliceSource>, Vec<u16>)> {
            let mut sources: Vec<Option<Box<dyn Read + Send>>> = Vec::with_capacity(total);
            for slot in &verified {
                sources.push(match slot {
                    Some(src) => Some(src.open_reader()?),
                    None => None,
                });
            }

            let mut sink_sgls: Vec<Option<Sgl>> = (0..total).map(|_| None).collect();
            let mut sink_paths: Vec<Option<std::path::PathBuf>> =
                (0..total).map(|_| None).collect();
            let mut sinks: Vec<Option<Box<dyn Write + Send>>> = Vec::with_capacity(total);
            for (idx, slot) in verified.iter().enumerate() {
                if slot.is_some() {
                    sinks.push(None);
                    continue;
                }
                if disk_mode {
                    let (path, file) =
                        mp.create_workfile(&bck_name, &format!("{name}.r{}", idx + 1))?;
                    sink_paths[idx] = Some(path);
                    sinks.push(Some(Box::new(file)));
                } else {
                    let sgl = Sgl::new();
                    sink_sgls[idx] = Some(sgl.clone());
                    sinks.push(Some(Box::new(sgl)));
                }
            }

            codec.reconstruct(&mut sources, &mut sinks, slice_size)?;
            drop(sources);
            drop(sinks);

            // Assemble the full slice list: survivors plus rebuilt pieces.
            let mut rebuilt_ids = Vec::new();
            let mut full: Vec<SliceSource> = Vec::with_capacity(total);
            for (idx, slot) in verified.into_iter().enumerate() {
                if let Some(src) = slot {
                    full.push(src);
                    continue;
                }
                rebuilt_ids.push(idx as u16 + 1);
                if let Some(path) = sink_paths[idx].take() {
                    std::fs::File::open(&path)?.sync_all()?;
                    full.push(SliceSource::workfile(path));
                } else if let Some(sgl) = sink_sgls[idx].take() {
                    full.push(SliceSource::sgl(sgl.freeze()));
                } else {
                    return Err(EcError::internal(format!(
                        "no sink produced for slice {}",
                        idx + 1
                    )));
                }
            }

            // The replica is the first `data` slices, truncated to size.
            let (work, mut file) = mp.create_workfile(&bck_name, &name)?;
            for src in full.iter().take(data) {
                let mut reader = src.open_reader()?;
                std::io::copy(&mut reader, &mut file)?;
            }
            file.flush()?;
            file.set_len(size)?;
            file.sync_all()?;
            drop(file);

            if checksum_file(&work, authoritative.ty)? != authoritative {
                let _ = std::fs::remove_file(&work);
                return Err(EcError::BadChecksum(format!(
                    "reconstructed object {uname}"
                )));
            }

            mp.rename_atomic(&work, &bck_name, ContentType::Replica, &name)?;
            main_md.store(&mp, &bck_name, &name)?;
            Ok((full, rebuilt_ids))
        })
        .await
        .map_err(|e| EcError::internal(e.to_string()))??
    };

    // REPAIR_PEERS: dispatch rebuilt slices to the placement slots whose
    // peers reported nothing in phase 1.
    debug!(%uname, state = ?RestoreState::RepairPeers, "repairing peers");
    let full_targets = place(&uname, smap, total + 1);
    for slice_id in rebuilt {
        let idx = slice_id as usize;
        if holders[idx].is_some() {
            continue;
        }
        let Some(target) = full_targets.get(idx).copied() else {
            continue;
        };
        if target == inner.me() {
            continue;
        }

        let src = full_sources[idx - 1].retain();
        let ck_ty = authoritative.ty;
        let prepared = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Checksum)> {
            let ck = checksum_source(&src, ck_ty)?;
            let bytes = src.read_all()?;
            src.release();
            Ok((bytes, ck))
        })
        .await
        .map_err(|e| EcError::internal(e.to_string()))?;
        let Ok((bytes, ck)) = prepared else {
            warn!(%uname, slice_id, "failed to prepare repair slice");
            continue;
        };

        let slice_md = main_md.clone_for_slice(slice_id, ck.clone());
        let mut header = inner.header(RequestKind::PutSlice, bck, name);
        header.size = slice_size;
        header.ck = Some(ck);
        header.meta = slice_md.to_bytes()?;
        debug!(%uname, slice_id, %target, "repairing missing slice");
        inner
            .bundle
            .send(target, header, Bytes::from(bytes), None)
            .await;
    }

    drop(reservation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_first_seen_tie() {
        let values = vec!["a", "b", "b", "a", "c"];
        // a and b both appear twice; a was seen first.
        assert_eq!(majority(values.into_iter()), Some("a"));
    }

    #[test]
    fn test_majority_clear_winner() {
        let values = vec![1, 2, 2, 2, 1];
        assert_eq!(majority(values.into_iter()), Some(2));
    }

    #[test]
    fn test_majority_empty() {
        assert_eq!(majority(std::iter::empty::<u8>()), None);
    }
}
