//! Responder: the peer-facing side of every target.
//!
//! One long-lived worker per bucket, spawned on demand and stopped after
//! sustained idleness. It answers metadata and payload fetches, stores
//! slices and replicas pushed by put schedulers and repairs, and handles
//! best-effort cleanup.
//!
//! Invariant: a stored slice or replica becomes visible only through its
//! sidecar, which is written strictly after the payload bytes are synced and
//! renamed. The sidecar write is the commit point; a payload file without a
//! sidecar is garbage for the next scan.

use crate::engine::EngineInner;
use crate::meta::SliceMeta;
use bytes::Bytes;
use dashmap::DashMap;
use scatterio_common::{EcError, Result};
use scatterio_fs::{ContentType, Mountpath};
use scatterio_transport::{Header, Incoming, RequestKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Demand-spawned per-bucket responder workers.
pub(crate) struct ResponderPool {
    inner: Arc<EngineInner>,
    buckets: DashMap<String, mpsc::UnboundedSender<Incoming>>,
    idle: Duration,
}

impl ResponderPool {
    pub fn new(inner: Arc<EngineInner>, idle: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            buckets: DashMap::new(),
            idle,
        })
    }

    /// Route a frame to its bucket worker, spawning one if needed.
    pub fn dispatch(self: &Arc<Self>, frame: Incoming) {
        let bucket = frame.header.bucket.clone();
        let mut frame = frame;
        for _ in 0..2 {
            let tx = {
                let entry = self
                    .buckets
                    .entry(bucket.clone())
                    .or_insert_with(|| self.spawn_worker(bucket.clone()));
                entry.value().clone()
            };
            match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The worker idled out between lookup and send; respawn.
                    self.buckets
                        .remove_if(&bucket, |_, existing| existing.same_channel(&tx));
                    frame = returned;
                }
            }
        }
        warn!(%bucket, "responder unavailable, dropping frame");
    }

    fn spawn_worker(self: &Arc<Self>, bucket: String) -> mpsc::UnboundedSender<Incoming> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Incoming>();
        let pool = Arc::clone(self);
        let my_tx = tx.clone();
        tokio::spawn(async move {
            debug!(%bucket, "responder started");
            loop {
                match tokio::time::timeout(pool.idle, rx.recv()).await {
                    Ok(Some(frame)) => {
                        if let Err(e) = serve(&pool.inner, frame).await {
                            pool.inner.stats.add_error();
                            warn!(%bucket, error = %e, "responder request failed");
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        debug!(%bucket, "responder idle, stopping");
                        break;
                    }
                }
            }
            pool.buckets
                .remove_if(&bucket, |_, existing| existing.same_channel(&my_tx));
        });
        tx
    }
}

async fn serve(inner: &Arc<EngineInner>, frame: Incoming) -> Result<()> {
    match frame.header.kind {
        RequestKind::GetMd => get_md(inner, frame).await,
        RequestKind::GetSlice => get_payload(inner, frame, ContentType::Slice).await,
        RequestKind::GetReplica => get_payload(inner, frame, ContentType::Replica).await,
        RequestKind::PutSlice => recv_put(inner, frame, ContentType::Slice).await,
        RequestKind::PutReplica => recv_put(inner, frame, ContentType::Replica).await,
        RequestKind::Del => {
            let inner = Arc::clone(inner);
            let bucket = frame.header.bucket.clone();
            let name = frame.header.name.clone();
            tokio::task::spawn_blocking(move || inner.delete_local(&bucket, &name))
                .await
                .map_err(|e| EcError::internal(e.to_string()))?;
            Ok(())
        }
        RequestKind::MdResp => {
            debug!("stray metadata reply at responder, ignoring");
            Ok(())
        }
    }
}

/// GET-MD: return the local sidecar, or an empty `meta` for not-found.
async fn get_md(inner: &Arc<EngineInner>, frame: Incoming) -> Result<()> {
    let uname = frame.header.uname();
    let mp = Arc::clone(inner.mountpaths.owner(&uname));
    let bucket = frame.header.bucket.clone();
    let name = frame.header.name.clone();

    let meta_bytes = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
        let path = mp.build_path(&bucket, ContentType::Meta, &name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    })
    .await
    .map_err(|e| EcError::internal(e.to_string()))??;

    let mut resp = reply_header(inner, &frame, RequestKind::MdResp);
    resp.meta = meta_bytes.unwrap_or_default();
    inner
        .bundle
        .send(frame.header.sender, resp, Bytes::new(), None)
        .await;
    Ok(())
}

/// GET-SLICE / GET-REPLICA: stream the payload back, with its sidecar in the
/// header. An empty payload tells the requester we have nothing.
async fn get_payload(inner: &Arc<EngineInner>, frame: Incoming, ct: ContentType) -> Result<()> {
    let uname = frame.header.uname();
    let mp = Arc::clone(inner.mountpaths.owner(&uname));
    let bucket = frame.header.bucket.clone();
    let name = frame.header.name.clone();

    let loaded = tokio::task::spawn_blocking(move || -> Result<Option<(Vec<u8>, SliceMeta)>> {
        let Some(md) = SliceMeta::load(&mp, &bucket, &name)? else {
            // A payload without its sidecar is unusable; delete it now
            // rather than waiting for the next scan.
            if mp.remove(&bucket, ct, &name)? {
                warn!(%bucket, %name, %ct, "dropped orphan payload without sidecar");
            }
            return Ok(None);
        };
        let path = mp.build_path(&bucket, ct, &name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some((bytes, md))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    })
    .await
    .map_err(|e| EcError::internal(e.to_string()))??;

    let resp_kind = match ct {
        ContentType::Replica => RequestKind::PutReplica,
        _ => RequestKind::PutSlice,
    };
    let mut resp = reply_header(inner, &frame, resp_kind);
    let payload = match loaded {
        Some((bytes, md)) => {
            resp.size = bytes.len() as u64;
            resp.ck = match ct {
                ContentType::Replica => Some(md.obj_cksum.clone()),
                _ => md.slice_cksum.clone(),
            };
            resp.meta = md.to_bytes()?;
            Bytes::from(bytes)
        }
        None => Bytes::new(),
    };
    inner.stats.add_bytes(payload.len() as u64);
    inner
        .bundle
        .send(frame.header.sender, resp, payload, None)
        .await;
    Ok(())
}

/// PUT-SLICE / PUT-REPLICA: workfile, checksum verify, rename, then sidecar.
async fn recv_put(inner: &Arc<EngineInner>, frame: Incoming, ct: ContentType) -> Result<()> {
    let uname = frame.header.uname();
    let md = SliceMeta::from_bytes(&frame.header.meta)?;
    let mp = Arc::clone(inner.mountpaths.owner(&uname));
    let bucket = frame.header.bucket.clone();
    let name = frame.header.name.clone();
    let expected = frame.header.ck.clone();
    let payload = frame.payload;

    inner.stats.add_bytes(payload.len() as u64);
    tokio::task::spawn_blocking(move || -> Result<()> {
        if let Some(ck) = &expected {
            if !ck.verify(&payload) {
                return Err(EcError::BadChecksum(format!(
                    "inbound {ct} for {bucket}/{name}"
                )));
            }
        }
        store_payload(&mp, &bucket, ct, &name, &payload, &md)
    })
    .await
    .map_err(|e| EcError::internal(e.to_string()))?
}

fn store_payload(
    mp: &Mountpath,
    bucket: &str,
    ct: ContentType,
    name: &str,
    payload: &[u8],
    md: &SliceMeta,
) -> Result<()> {
    use std::io::Write;

    let (work, mut file) = mp.create_workfile(bucket, name)?;
    let written: Result<()> = (|| {
        file.write_all(payload)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&work);
        return Err(e);
    }
    drop(file);
    mp.rename_atomic(&work, bucket, ct, name)?;
    md.store(mp, bucket, name)?;
    Ok(())
}

fn reply_header(inner: &Arc<EngineInner>, frame: &Incoming, kind: RequestKind) -> Header {
    let mut resp = Header::new(
        kind,
        inner.me(),
        &frame.header.bucket,
        frame.header.bucket_id,
        &frame.header.name,
    );
    resp.seq = frame.header.seq;
    resp.compression = frame.header.compression;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatterio_common::{Bck, Checksum, ChecksumType, EcConfig};
    use tempfile::tempdir;

    #[test]
    fn test_store_payload_commit_order() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path()).unwrap();
        let od = crate::object::ObjectDesc {
            bck: Bck::new("bck", 1, EcConfig::new(4, 2)),
            name: "obj".into(),
            size: 4,
            version: "v1".into(),
            cksum: Checksum::compute(ChecksumType::XxHash64, b"data"),
        };
        let md = SliceMeta::main(&od, true);

        store_payload(&mp, "bck", ContentType::Replica, "obj", b"data", &md).unwrap();

        assert!(mp.exists("bck", ContentType::Replica, "obj"));
        let back = SliceMeta::load(&mp, "bck", "obj").unwrap().unwrap();
        assert_eq!(back, md);
        // No workfile survives the rename.
        assert!(mp.list_content("bck", ContentType::Work).unwrap().is_empty());
    }
}
