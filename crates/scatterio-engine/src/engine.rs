//! The engine handle: dependency-injected assembly of schedulers, responder
//! pool, and the receive demultiplexer.

use crate::get::{GetCmd, GetScheduler};
use crate::meta::SliceMeta;
use crate::object::ObjectDesc;
use crate::put::{PutCmd, PutScheduler};
use crate::respond::ResponderPool;
use crate::scrub::{ScrubReport, scrub_mountpath};
use dashmap::DashMap;
use scatterio_common::{
    Bck, Checksum, ChecksumCalculator, EcError, EcStats, Result, StatsSnapshot, TargetId, uname,
};
use scatterio_erasure::{MemBudget, SliceSource};
use scatterio_fs::{ContentType, Mountpath, Mountpaths};
use scatterio_placement::SmapView;
use scatterio_transport::{Bundle, Header, Incoming, Link, RequestKind, RpcClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Nonce space for slice-fetch correlation, disjoint from the RPC sequence
/// space.
const NONCE_BASE: u64 = 1 << 63;

/// Startup configuration for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub target_id: TargetId,
    pub mountpaths: Vec<PathBuf>,
    /// Hard timeout for metadata and slice broadcasts.
    pub send_file_time: Duration,
    /// Per-destination cap on outstanding sends.
    pub bundle_cap: usize,
    /// Concurrent restores allowed per mountpath.
    pub restore_parallelism: usize,
    /// Budget for in-memory slice buffers; exceeding it spills to workfiles.
    pub mem_capacity: u64,
    /// Idle time before a bucket responder exits.
    pub responder_idle: Duration,
}

impl EngineConfig {
    #[must_use]
    pub fn new(target_id: TargetId, mountpaths: Vec<PathBuf>) -> Self {
        Self {
            target_id,
            mountpaths,
            send_file_time: Duration::from_secs(5),
            bundle_cap: 4,
            restore_parallelism: 4,
            mem_capacity: 256 * 1024 * 1024,
            responder_idle: Duration::from_secs(60),
        }
    }
}

/// State shared by every worker of one engine.
pub(crate) struct EngineInner {
    pub cfg: EngineConfig,
    pub smap: SmapView,
    pub mountpaths: Mountpaths,
    pub bundle: Arc<Bundle>,
    pub rpc: Arc<RpcClient>,
    /// Receive sinks for in-flight slice fetches, keyed `(peer, uname)`.
    pub sinks: DashMap<(TargetId, String), mpsc::UnboundedSender<Incoming>>,
    pub stats: Arc<EcStats>,
    pub mem: Arc<MemBudget>,
    obj_locks: DashMap<String, Arc<Mutex<()>>>,
    nonce: AtomicU64,
}

impl EngineInner {
    pub fn me(&self) -> TargetId {
        self.cfg.target_id
    }

    /// Exclusive lock on an object's finalization window. One encode and one
    /// restore for the same (bucket, name) never overlap on this target.
    pub async fn lock_object(&self, uname: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self
                .obj_locks
                .entry(uname.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    pub fn header(&self, kind: RequestKind, bck: &Bck, name: &str) -> Header {
        let mut header = Header::new(kind, self.me(), &bck.name, bck.id, name);
        header.compression = bck.props.compression;
        header
    }

    /// Correlation nonce for slice-fetch replies.
    pub fn next_nonce(&self) -> u64 {
        NONCE_BASE | self.nonce.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn register_sink(
        &self,
        peer: TargetId,
        uname: &str,
        tx: mpsc::UnboundedSender<Incoming>,
    ) {
        self.sinks.insert((peer, uname.to_string()), tx);
    }

    pub fn unregister_sink(&self, peer: TargetId, uname: &str) {
        self.sinks.remove(&(peer, uname.to_string()));
    }

    /// Best-effort local cleanup: sidecars first, then replica, then slices.
    /// Per-file errors are logged, never surfaced.
    pub fn delete_local(&self, bucket: &str, name: &str) {
        for mp in self.mountpaths.iter() {
            for ct in [ContentType::Meta, ContentType::Replica, ContentType::Slice] {
                if let Err(e) = mp.remove(bucket, ct, name) {
                    warn!(bucket, name, %ct, error = %e, "cleanup failed");
                }
            }
        }
    }
}

/// Checksum of a slice source, streamed.
pub(crate) fn checksum_source(
    src: &SliceSource,
    ty: scatterio_common::ChecksumType,
) -> Result<Checksum> {
    let mut reader = src.open_reader()?;
    let mut calc = ChecksumCalculator::new(ty);
    std::io::copy(&mut reader, &mut calc)?;
    Ok(calc.finalize())
}

/// Checksum of a file, streamed.
pub(crate) fn checksum_file(path: &std::path::Path, ty: scatterio_common::ChecksumType) -> Result<Checksum> {
    let mut file = std::fs::File::open(path)?;
    let mut calc = ChecksumCalculator::new(ty);
    std::io::copy(&mut file, &mut calc)?;
    Ok(calc.finalize())
}

/// The erasure-coding engine of one storage target.
///
/// Owns one put scheduler and one get scheduler per mountpath, the per-bucket
/// responder pool, and the transport demultiplexer. All collaborators (wire
/// link, cluster map view, mountpath roots) are injected at construction.
pub struct Engine {
    inner: Arc<EngineInner>,
    put_live: Vec<mpsc::UnboundedSender<PutCmd>>,
    put_background: Vec<mpsc::UnboundedSender<PutCmd>>,
    get_tx: Vec<mpsc::UnboundedSender<GetCmd>>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Assemble and start an engine. `inbox` is the stream of frames the
    /// link delivers to this target.
    pub fn new(
        cfg: EngineConfig,
        link: Arc<dyn Link>,
        smap: SmapView,
        inbox: mpsc::UnboundedReceiver<Incoming>,
    ) -> Result<Self> {
        let mountpaths = Mountpaths::new(cfg.mountpaths.clone())?;
        let bundle = Bundle::new(link, cfg.bundle_cap);
        let rpc = RpcClient::new(Arc::clone(&bundle), cfg.send_file_time);
        let mem = MemBudget::new(cfg.mem_capacity);

        let inner = Arc::new(EngineInner {
            smap,
            mountpaths,
            bundle,
            rpc,
            sinks: DashMap::new(),
            stats: Arc::new(EcStats::default()),
            mem,
            obj_locks: DashMap::new(),
            nonce: AtomicU64::new(0),
            cfg,
        });

        let responders = ResponderPool::new(Arc::clone(&inner), inner.cfg.responder_idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(demux_loop(
            Arc::clone(&inner),
            responders,
            inbox,
            stop_rx.clone(),
        )));

        let mut put_live = Vec::new();
        let mut put_background = Vec::new();
        let mut get_tx = Vec::new();
        for mp in inner.mountpaths.iter() {
            let (live_tx, live_rx) = mpsc::unbounded_channel();
            let (bg_tx, bg_rx) = mpsc::unbounded_channel();
            let ps = PutScheduler::new(
                Arc::clone(&inner),
                Arc::clone(mp),
                live_rx,
                bg_rx,
                stop_rx.clone(),
            );
            tasks.push(tokio::spawn(ps.run()));
            put_live.push(live_tx);
            put_background.push(bg_tx);

            let (g_tx, g_rx) = mpsc::unbounded_channel();
            let gs = GetScheduler::new(
                Arc::clone(&inner),
                Arc::clone(mp),
                g_rx,
                stop_rx.clone(),
                inner.cfg.restore_parallelism,
            );
            tasks.push(tokio::spawn(gs.run()));
            get_tx.push(g_tx);
        }

        info!(target_id = %inner.me(), mountpaths = inner.mountpaths.len(), "engine started");
        Ok(Self {
            inner,
            put_live,
            put_background,
            get_tx,
            stop_tx,
            tasks,
        })
    }

    #[must_use]
    pub fn target_id(&self) -> TargetId {
        self.inner.me()
    }

    #[must_use]
    pub fn mountpaths(&self) -> &Mountpaths {
        &self.inner.mountpaths
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Encode a freshly written object: replicate or slice it and scatter the
    /// pieces. Returns once the local state is durable and peer sends have
    /// completed (successfully or loss-visibly).
    pub async fn encode(&self, od: ObjectDesc) -> Result<()> {
        let idx = self.inner.mountpaths.owner_index(&od.uname());
        let (done_tx, done_rx) = oneshot::channel();
        self.put_live[idx]
            .send(PutCmd::Encode { od, done: done_tx })
            .map_err(|_| EcError::internal("put scheduler stopped"))?;
        done_rx
            .await
            .map_err(|_| EcError::internal("put scheduler dropped the request"))?
    }

    /// Queue one background re-encode batch. The batch must respect the
    /// bucket's `batch_size`; objects whose persisted sidecar was written
    /// with different (data, parity) geometry are skipped — only
    /// `objsize_limit` may change once EC is enabled.
    pub async fn enqueue_reencode(&self, ods: Vec<ObjectDesc>) -> Result<()> {
        if let Some(first) = ods.first() {
            let limit = first.bck.props.batch_size as usize;
            if ods.len() > limit {
                return Err(EcError::InvalidConfig(format!(
                    "re-encode batch of {} exceeds batch_size {limit}",
                    ods.len()
                )));
            }
        }
        for od in ods {
            let uname = od.uname();
            let idx = self.inner.mountpaths.owner_index(&uname);
            let mp = self.inner.mountpaths.owner(&uname);
            if let Some(md) = SliceMeta::load(mp, &od.bck.name, &od.name)? {
                if md.data != od.bck.props.data_slices || md.parity != od.bck.props.parity_slices {
                    warn!(
                        %uname,
                        "re-encode skipped: slice geometry changed since encode"
                    );
                    continue;
                }
            }
            self.put_background[idx]
                .send(PutCmd::Reencode { od })
                .map_err(|_| EcError::internal("put scheduler stopped"))?;
        }
        Ok(())
    }

    /// Restore the object's main replica on this target from peer copies or
    /// slices.
    pub async fn restore(&self, bck: Bck, name: &str) -> Result<()> {
        let uname = uname(&bck.name, name);
        let idx = self.inner.mountpaths.owner_index(&uname);
        let (done_tx, done_rx) = oneshot::channel();
        self.get_tx[idx]
            .send(GetCmd::Restore {
                bck,
                name: name.to_string(),
                done: done_tx,
            })
            .map_err(|_| EcError::internal("get scheduler stopped"))?;
        done_rx
            .await
            .map_err(|_| EcError::internal("get scheduler dropped the request"))?
    }

    /// Read the object's bytes, verifying the checksum. A missing or corrupt
    /// local replica triggers recovery — other-mountpath replica, then
    /// EC restore — with at most one retry before `BadChecksum` surfaces.
    pub async fn read_object(&self, od: &ObjectDesc) -> Result<Vec<u8>> {
        let uname = od.uname();
        let mp = Arc::clone(self.inner.mountpaths.owner(&uname));
        let bucket = od.bck.name.clone();
        let name = od.name.clone();

        let local = {
            let mp = Arc::clone(&mp);
            let bucket = bucket.clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || {
                read_replica(&mp, &bucket, &name)
            })
            .await
            .map_err(|e| EcError::internal(e.to_string()))??
        };

        match local {
            Some(bytes) if od.cksum.verify(&bytes) => return Ok(bytes),
            Some(_) => {
                warn!(%uname, "local replica failed checksum, recovering");
                self.inner.stats.add_error();
                let _ = mp.remove(&bucket, ContentType::Replica, &name);

                // A copy on another mountpath of this target wins first.
                if let Some(bytes) = self.recover_from_local_mountpaths(od, &mp).await? {
                    return Ok(bytes);
                }
            }
            None => {}
        }

        // Remote recovery: peer replicas or EC slices, depending on the
        // surviving metadata.
        self.restore(od.bck.clone(), &od.name).await?;

        let bytes = {
            let mp = Arc::clone(&mp);
            let bucket = bucket.clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || read_replica(&mp, &bucket, &name))
                .await
                .map_err(|e| EcError::internal(e.to_string()))??
        };
        match bytes {
            Some(bytes) if od.cksum.verify(&bytes) => Ok(bytes),
            _ => Err(EcError::BadChecksum(uname)),
        }
    }

    async fn recover_from_local_mountpaths(
        &self,
        od: &ObjectDesc,
        owner: &Arc<Mountpath>,
    ) -> Result<Option<Vec<u8>>> {
        let inner = Arc::clone(&self.inner);
        let od = od.clone();
        let owner = Arc::clone(owner);
        tokio::task::spawn_blocking(move || {
            for mp in inner.mountpaths.iter() {
                if mp.root() == owner.root() {
                    continue;
                }
                let Some(md) = SliceMeta::load(mp, &od.bck.name, &od.name)? else {
                    continue;
                };
                if md.slice_id != 0 {
                    continue;
                }
                let Some(bytes) = read_replica(mp, &od.bck.name, &od.name)? else {
                    continue;
                };
                if !od.cksum.verify(&bytes) {
                    continue;
                }
                owner.write_content(&od.bck.name, ContentType::Replica, &od.name, &bytes)?;
                md.store(&owner, &od.bck.name, &od.name)?;
                debug!(uname = %od.uname(), "recovered replica from sibling mountpath");
                return Ok(Some(bytes));
            }
            Ok(None)
        })
        .await
        .map_err(|e| EcError::internal(e.to_string()))?
    }

    /// Engine-initiated delete: local cleanup, then a DEL broadcast with no
    /// acknowledgement wait.
    pub async fn delete(&self, bck: &Bck, name: &str) -> Result<()> {
        let start = Instant::now();
        let uname = uname(&bck.name, name);
        let _guard = self.inner.lock_object(&uname).await;

        {
            let inner = Arc::clone(&self.inner);
            let bucket = bck.name.clone();
            let name = name.to_string();
            tokio::task::spawn_blocking(move || inner.delete_local(&bucket, &name))
                .await
                .map_err(|e| EcError::internal(e.to_string()))?;
        }

        let smap = self.inner.smap.load();
        for peer in smap.peers(&self.inner.me()) {
            let header = self.inner.header(RequestKind::Del, bck, name);
            self.inner.bundle.notify(peer, header).await;
        }

        self.inner.stats.add_delete_time(start.elapsed());
        Ok(())
    }

    /// Crash-recovery scan over every mountpath: drop orphan payload files,
    /// stale sidecars, and leftover workfiles.
    pub async fn scrub(&self, buckets: &[Bck]) -> Result<ScrubReport> {
        let live: std::collections::HashMap<String, u64> = buckets
            .iter()
            .map(|b| (b.name.clone(), b.id))
            .collect();
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut report = ScrubReport::default();
            for mp in inner.mountpaths.iter() {
                report.merge(scrub_mountpath(mp, &live)?);
            }
            Ok(report)
        })
        .await
        .map_err(|e| EcError::internal(e.to_string()))?
    }

    /// Signal every worker to drain and exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn read_replica(mp: &Mountpath, bucket: &str, name: &str) -> Result<Option<Vec<u8>>> {
    let path = mp.build_path(bucket, ContentType::Replica, name);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Route inbound frames: RPC replies to their callers, slice-fetch replies to
/// registered sinks, everything else to the per-bucket responders.
async fn demux_loop(
    inner: Arc<EngineInner>,
    responders: Arc<ResponderPool>,
    mut inbox: mpsc::UnboundedReceiver<Incoming>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            frame = inbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let Some(frame) = inner.rpc.complete(frame) else {
            continue;
        };

        match frame.header.kind {
            RequestKind::PutSlice | RequestKind::PutReplica => {
                let key = (frame.header.sender, frame.header.uname());
                if let Some(tx) = inner.sinks.get(&key) {
                    if tx.send(frame).is_ok() {
                        continue;
                    }
                    drop(tx);
                    inner.sinks.remove(&key);
                    continue;
                }
                if frame.header.seq != 0 {
                    // A reply whose waiter is gone; dropping it is the
                    // at-most-once contract, not an error.
                    debug!(uname = %frame.header.uname(), "orphan reply dropped");
                    continue;
                }
                responders.dispatch(frame);
            }
            RequestKind::MdResp => {
                debug!(uname = %frame.header.uname(), "orphan metadata reply dropped");
            }
            _ => responders.dispatch(frame),
        }
    }
    debug!(target_id = %inner.me(), "demux loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_space_disjoint_from_rpc() {
        // RPC seqs count up from 1; nonces live in the top half.
        let cfg = EngineConfig::new(TargetId::new(), vec![]);
        assert!(cfg.bundle_cap > 0);
        assert!(NONCE_BASE > u64::from(u32::MAX));
    }

    #[tokio::test]
    async fn test_object_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::new(TargetId::new(), vec![dir.path().to_path_buf()]);
        let inner = EngineInner {
            smap: SmapView::new(scatterio_placement::Smap::new(1)),
            mountpaths: Mountpaths::new(cfg.mountpaths.clone()).unwrap(),
            bundle: Bundle::new(scatterio_transport::LoopbackNet::new(), 1),
            rpc: RpcClient::new(
                Bundle::new(scatterio_transport::LoopbackNet::new(), 1),
                Duration::from_secs(1),
            ),
            sinks: DashMap::new(),
            stats: Arc::new(EcStats::default()),
            mem: MemBudget::new(1024),
            obj_locks: DashMap::new(),
            nonce: AtomicU64::new(0),
            cfg,
        };

        let guard = inner.lock_object("bck/obj").await;
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            inner.lock_object("bck/obj"),
        )
        .await;
        assert!(second.is_err(), "same object must serialize");
        drop(guard);

        // A different object is independent.
        let _other = inner.lock_object("bck/other").await;
    }
}
