//! Data bundle: one-way sends with completion callbacks and per-destination
//! parallelism caps.

use crate::{TransportError, link::Link, wire::Header};
use bytes::Bytes;
use dashmap::DashMap;
use scatterio_common::TargetId;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Completion callback: called exactly once, after which the payload and any
/// user state may be freed.
pub type SendCb = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Streaming channel to peers.
///
/// `send` acquires a per-destination permit before the frame leaves, so a
/// slow peer backpressures its own queue without starving others. Delivery is
/// at-most-once; the callback reports the loss and the caller owns the retry
/// decision.
pub struct Bundle {
    link: Arc<dyn Link>,
    caps: DashMap<TargetId, Arc<Semaphore>>,
    per_dest: usize,
}

impl Bundle {
    #[must_use]
    pub fn new(link: Arc<dyn Link>, per_dest: usize) -> Arc<Self> {
        Arc::new(Self {
            link,
            caps: DashMap::new(),
            per_dest: per_dest.max(1),
        })
    }

    fn cap(&self, to: &TargetId) -> Arc<Semaphore> {
        Arc::clone(
            &self
                .caps
                .entry(*to)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_dest))),
        )
    }

    /// Queue a one-way send. Blocks the caller only while the destination is
    /// at its parallelism cap; the transfer itself runs in a spawned task and
    /// reports through `cb`.
    pub async fn send(&self, to: TargetId, header: Header, payload: Bytes, cb: Option<SendCb>) {
        let sem = self.cap(&to);
        let permit = match sem.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                if let Some(cb) = cb {
                    cb(Err(TransportError::Closed));
                }
                return;
            }
        };
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            let result = link.deliver(&to, header, payload).await;
            drop(permit);
            match (cb, result) {
                (Some(cb), result) => cb(result),
                (None, Err(e)) => warn!(peer = %to, error = %e, "send failed"),
                (None, Ok(())) => {}
            }
        });
    }

    /// Zero-payload control message, no completion callback.
    pub async fn notify(&self, to: TargetId, header: Header) {
        self.send(to, header, Bytes::new(), None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNet;
    use crate::wire::RequestKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_callback_fires_once_on_success_and_failure() {
        let net = LoopbackNet::new();
        let a = TargetId::new();
        let b = TargetId::new();
        let mut inbox = net.register(b);

        let bundle = Bundle::new(net.clone(), 4);
        let hits = Arc::new(AtomicUsize::new(0));
        let errs = Arc::new(AtomicUsize::new(0));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        {
            let hits = Arc::clone(&hits);
            let header = Header::new(RequestKind::PutSlice, a, "bck", 1, "obj");
            bundle
                .send(
                    b,
                    header,
                    Bytes::from_static(b"x"),
                    Some(Box::new(move |res| {
                        assert!(res.is_ok());
                        hits.fetch_add(1, Ordering::SeqCst);
                        let _ = done_tx.send(());
                    })),
                )
                .await;
        }
        done_rx.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(inbox.recv().await.is_some());

        // Unknown destination: the callback still fires, with the error.
        let ghost = TargetId::new();
        let (err_tx, err_rx) = tokio::sync::oneshot::channel();
        {
            let errs = Arc::clone(&errs);
            let header = Header::new(RequestKind::PutSlice, a, "bck", 1, "obj");
            bundle
                .send(
                    ghost,
                    header,
                    Bytes::new(),
                    Some(Box::new(move |res| {
                        assert!(res.is_err());
                        errs.fetch_add(1, Ordering::SeqCst);
                        let _ = err_tx.send(());
                    })),
                )
                .await;
        }
        err_rx.await.unwrap();
        assert_eq!(errs.load(Ordering::SeqCst), 1);
    }
}
