//! Put scheduler: encode newly written objects and scatter the pieces.
//!
//! One scheduler per mountpath, a single-threaded event loop over two
//! queues — live PUTs and background re-encodes — with a fairness budget so
//! background work cannot starve and live work cannot monopolize. Codec and
//! file work runs on the blocking pool; network fan-out completes through
//! bundle callbacks feeding an ack channel.
//!
//! Ordering: the metadata sidecar for the main replica is persisted *before*
//! any slice leaves this target. A crash after dispatch but before local MD
//! is recoverable from peers; a crash after MD but before dispatch is
//! recoverable through the responder.

use crate::engine::{EngineInner, checksum_source};
use crate::meta::SliceMeta;
use crate::object::ObjectDesc;
use bytes::Bytes;
use scatterio_common::{Checksum, EcError, ObjectName, Result, TargetId};
use scatterio_erasure::{Sgl, SliceSource, StreamCodec, slice_size_for};
use scatterio_fs::Mountpath;
use scatterio_placement::place;
use scatterio_transport::{RequestKind, TransportError};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Live items processed consecutively before one background item may run.
const LIVE_BUDGET: u32 = 8;

/// Work accepted by the put scheduler.
pub(crate) enum PutCmd {
    /// Live PUT awaiting encode; the caller blocks on `done`.
    Encode {
        od: ObjectDesc,
        done: oneshot::Sender<Result<()>>,
    },
    /// Background re-encode scan item.
    Reencode { od: ObjectDesc },
}

pub(crate) struct PutScheduler {
    inner: Arc<EngineInner>,
    mp: Arc<Mountpath>,
    live: mpsc::UnboundedReceiver<PutCmd>,
    background: mpsc::UnboundedReceiver<PutCmd>,
    stop: watch::Receiver<bool>,
}

impl PutScheduler {
    pub fn new(
        inner: Arc<EngineInner>,
        mp: Arc<Mountpath>,
        live: mpsc::UnboundedReceiver<PutCmd>,
        background: mpsc::UnboundedReceiver<PutCmd>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner,
            mp,
            live,
            background,
            stop,
        }
    }

    pub async fn run(mut self) {
        let mut live_streak = 0u32;
        loop {
            if live_streak >= LIVE_BUDGET {
                live_streak = 0;
                if let Ok(cmd) = self.background.try_recv() {
                    self.handle(cmd).await;
                    continue;
                }
            }
            tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }
                cmd = self.live.recv() => match cmd {
                    Some(cmd) => {
                        live_streak += 1;
                        self.handle(cmd).await;
                    }
                    None => break,
                },
                cmd = self.background.recv() => match cmd {
                    Some(cmd) => {
                        live_streak = 0;
                        self.handle(cmd).await;
                    }
                    None => break,
                },
            }
        }
        debug!(mountpath = %self.mp.root().display(), "put scheduler stopped");
    }

    async fn handle(&self, cmd: PutCmd) {
        match cmd {
            PutCmd::Encode { od, done } => {
                let result = self.encode_object(od).await;
                let _ = done.send(result);
            }
            PutCmd::Reencode { od } => {
                let uname = od.uname();
                if let Err(e) = self.encode_object(od).await {
                    warn!(%uname, error = %e, "background re-encode failed");
                    self.inner.stats.add_error();
                }
            }
        }
    }

    async fn encode_object(&self, od: ObjectDesc) -> Result<()> {
        let props = od.bck.props;
        if !props.enabled {
            return Err(EcError::Disabled(od.bck.name.clone()));
        }
        props
            .validate()
            .map_err(|e| EcError::InvalidConfig(e.to_string()))?;
        ObjectName::new(&od.name).map_err(|e| EcError::InvalidConfig(e.to_string()))?;

        let uname = od.uname();
        let _guard = self.inner.lock_object(&uname).await;
        let start = Instant::now();

        // Re-running encode for an unchanged object is a no-op.
        if let Some(md) = SliceMeta::load(&self.mp, &od.bck.name, &od.name)? {
            if md.bucket_id == od.bck.id
                && md.obj_version == od.version
                && md.obj_cksum == od.cksum
            {
                debug!(%uname, "object already protected, skipping");
                return Ok(());
            }
        }

        let replicate = props.replicate(od.size);
        let smap = self.inner.smap.load();
        let need = if replicate {
            props.replica_count()
        } else {
            props.total_slices() + 1
        };
        if smap.count() < need {
            return Err(EcError::InsufficientTargets {
                have: smap.count(),
                need,
            });
        }
        let targets = place(&uname, &smap, need);

        // Metadata first, bytes second.
        let md = SliceMeta::main(&od, replicate);
        md.store(&self.mp, &od.bck.name, &od.name)?;

        let result = if replicate {
            self.replicate_object(&od, &md, &targets).await
        } else {
            self.encode_slices(&od, &md, &targets).await
        };

        match result {
            Ok(()) => {
                self.inner.stats.add_object(od.size);
                self.inner.stats.add_encode_time(start.elapsed());
                debug!(%uname, replicate, "encode complete");
                Ok(())
            }
            Err(e) => {
                // No partial objects: tear down whatever landed locally.
                self.inner.stats.add_error();
                self.inner.delete_local(&od.bck.name, &od.name);
                Err(e)
            }
        }
    }

    /// Replicated path: full copies to the `parity` targets that follow the
    /// main target in placement order.
    async fn replicate_object(
        &self,
        od: &ObjectDesc,
        md: &SliceMeta,
        targets: &[TargetId],
    ) -> Result<()> {
        let path = od.replica_path(&self.mp);
        let bytes = tokio::task::spawn_blocking(move || std::fs::read(path))
            .await
            .map_err(|e| EcError::internal(e.to_string()))??;
        let payload = Bytes::from(bytes);

        let copy_md = md.clone_for_copy();
        let meta_bytes = copy_md.to_bytes()?;
        let me = self.inner.me();

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<std::result::Result<(), TransportError>>();
        let mut sent = 0usize;
        for target in targets.iter().skip(1) {
            if *target == me {
                continue;
            }
            let mut header = self.inner.header(RequestKind::PutReplica, &od.bck, &od.name);
            header.size = payload.len() as u64;
            header.ck = Some(od.cksum.clone());
            header.meta = meta_bytes.clone();

            let tx = ack_tx.clone();
            self.inner
                .bundle
                .send(
                    *target,
                    header,
                    payload.clone(),
                    Some(Box::new(move |res| {
                        let _ = tx.send(res);
                    })),
                )
                .await;
            sent += 1;
        }
        drop(ack_tx);

        let mut failed = 0usize;
        while let Some(res) = ack_rx.recv().await {
            if let Err(e) = res {
                failed += 1;
                warn!(uname = %od.uname(), error = %e, "replica send failed");
                self.inner.stats.add_error();
            }
        }
        if sent > 0 && failed == sent {
            return Err(EcError::transport("no replica copy was delivered"));
        }
        Ok(())
    }

    /// Encoded path: slice the replica, compute parity, dispatch slice `i` to
    /// the `i`-th placement target.
    async fn encode_slices(
        &self,
        od: &ObjectDesc,
        md: &SliceMeta,
        targets: &[TargetId],
    ) -> Result<()> {
        let props = od.bck.props;
        let data = props.data_slices as usize;
        let parity = props.parity_slices as usize;
        let slice_size = slice_size_for(od.size, data);
        let replica_path = od.replica_path(&self.mp);
        let ck_ty = od.cksum.ty;

        // Memory mode unless the shared budget is exhausted or the bucket
        // forces disk.
        let required = od.size * (data as u64 + parity as u64) / (parity as u64).max(1);
        let reservation = if props.disk_only {
            None
        } else {
            self.inner.mem.try_reserve(required)
        };
        let disk_mode = reservation.is_none();

        // Data slices are zero-padded sections of the local replica.
        let mut data_sources = Vec::with_capacity(data);
        for i in 0..data {
            let offset = i as u64 * slice_size;
            let len = od.size.saturating_sub(offset).min(slice_size);
            data_sources.push(SliceSource::file_section(
                replica_path.clone(),
                offset,
                len,
                slice_size,
            ));
        }

        let mut parity_paths: Vec<PathBuf> = Vec::new();
        let mut parity_files: Vec<std::fs::File> = Vec::new();
        if disk_mode {
            for i in 0..parity {
                let (path, file) = self
                    .mp
                    .create_workfile(&od.bck.name, &format!("{}.p{i}", od.name))?;
                parity_paths.push(path);
                parity_files.push(file);
            }
        }
        let sgls: Option<Vec<Sgl>> = (!disk_mode).then(|| (0..parity).map(|_| Sgl::new()).collect());

        let codec = StreamCodec::new(data, parity).map_err(EcError::from)?;

        // Encoding and data-slice checksumming read the replica through
        // independent section readers and run concurrently.
        let encode_task = {
            let sources = data_sources.clone();
            let sgls = sgls.clone();
            let parity_paths = parity_paths.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<Checksum>> {
                let mut readers: Vec<Box<dyn Read + Send>> = Vec::with_capacity(sources.len());
                for src in &sources {
                    readers.push(src.open_reader()?);
                }
                let mut writers: Vec<Box<dyn Write + Send>> = match &sgls {
                    Some(sgls) => sgls
                        .iter()
                        .cloned()
                        .map(|s| Box::new(s) as Box<dyn Write + Send>)
                        .collect(),
                    None => parity_files
                        .into_iter()
                        .map(|f| Box::new(f) as Box<dyn Write + Send>)
                        .collect(),
                };
                codec.encode(&mut readers, &mut writers, slice_size)?;
                drop(writers);

                // Finalize parity checksums after the codec is done.
                let mut cksums = Vec::with_capacity(parity_paths.len());
                match &sgls {
                    Some(sgls) => {
                        for sgl in sgls {
                            cksums.push(checksum_source(
                                &SliceSource::sgl(sgl.freeze()),
                                ck_ty,
                            )?);
                        }
                    }
                    None => {
                        for path in &parity_paths {
                            std::fs::File::open(path)?.sync_all()?;
                            cksums.push(crate::engine::checksum_file(path, ck_ty)?);
                        }
                    }
                }
                Ok(cksums)
            })
        };

        let cksum_task = {
            let sources = data_sources.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<Checksum>> {
                sources.iter().map(|s| checksum_source(s, ck_ty)).collect()
            })
        };

        let (parity_cksums, data_cksums) = tokio::join!(encode_task, cksum_task);
        let parity_cksums = parity_cksums.map_err(|e| EcError::internal(e.to_string()))??;
        let data_cksums = data_cksums.map_err(|e| EcError::internal(e.to_string()))??;

        let parity_sources: Vec<SliceSource> = match sgls {
            Some(sgls) => sgls
                .iter()
                .map(|s| SliceSource::sgl(s.freeze()))
                .collect(),
            None => parity_paths.into_iter().map(SliceSource::workfile).collect(),
        };

        let mut all_sources = data_sources;
        all_sources.extend(parity_sources);
        let mut all_cksums = data_cksums;
        all_cksums.extend(parity_cksums);

        // Dispatch slice i (1-indexed) to target i; the main replica stays.
        let me = self.inner.me();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<std::result::Result<(), TransportError>>();
        let mut sent = 0usize;
        for (idx, source) in all_sources.iter().enumerate() {
            let slice_id = idx as u16 + 1;
            let target = targets[idx + 1];
            if target == me {
                warn!(uname = %od.uname(), slice_id, "placement returned self, skipping");
                continue;
            }

            let ck = all_cksums[idx].clone();
            let slice_md = md.clone_for_slice(slice_id, ck.clone());
            let mut header = self.inner.header(RequestKind::PutSlice, &od.bck, &od.name);
            header.size = slice_size;
            header.ck = Some(ck);
            header.meta = slice_md.to_bytes()?;

            let src = source.retain();
            let payload = tokio::task::spawn_blocking(move || src.read_all())
                .await
                .map_err(|e| EcError::internal(e.to_string()))??;

            let src = source.retain();
            let tx = ack_tx.clone();
            self.inner
                .bundle
                .send(
                    target,
                    header,
                    Bytes::from(payload),
                    Some(Box::new(move |res| {
                        src.release();
                        let _ = tx.send(res);
                    })),
                )
                .await;
            sent += 1;
        }
        drop(ack_tx);
        drop(all_sources);

        let mut failed = 0usize;
        while let Some(res) = ack_rx.recv().await {
            if let Err(e) = res {
                failed += 1;
                warn!(uname = %od.uname(), error = %e, "slice send failed");
                self.inner.stats.add_error();
            }
        }
        drop(reservation);

        // Peers may tolerate missing slices; a restore stays possible while
        // at least `data` pieces survive. Losing more than `parity` sends
        // leaves the object under-protected, which is an encode failure.
        if failed > parity {
            return Err(EcError::transport(format!(
                "{failed} of {sent} slice sends failed"
            )));
        }
        Ok(())
    }
}
