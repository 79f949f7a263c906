//! Small-RPC client: seq-correlated request/response over the one-way link.
//!
//! Control messages (metadata fetch, replica fetch) carry a nonzero `seq`;
//! the responder echoes it on the reply and the receive loop hands the frame
//! back through [`RpcClient::complete`]. Requests never correlate — only
//! reply kinds do — so two targets using overlapping sequence spaces cannot
//! cross wires.

use crate::{
    TransportError,
    bundle::Bundle,
    link::Incoming,
    wire::Header,
};
use dashmap::DashMap;
use scatterio_common::TargetId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Shared client for small control RPCs.
pub struct RpcClient {
    bundle: Arc<Bundle>,
    pending: DashMap<u64, oneshot::Sender<Incoming>>,
    seq: AtomicU64,
    timeout: Duration,
}

impl RpcClient {
    #[must_use]
    pub fn new(bundle: Arc<Bundle>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bundle,
            pending: DashMap::new(),
            seq: AtomicU64::new(0),
            timeout,
        })
    }

    /// Send `header` to `to` and wait for the correlated reply.
    pub async fn call(&self, to: TargetId, mut header: Header) -> Result<Incoming, TransportError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        header.seq = seq;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        self.bundle
            .send(to, header, bytes::Bytes::new(), None)
            .await;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(incoming)) => Ok(incoming),
            Ok(Err(_)) => {
                self.pending.remove(&seq);
                Err(TransportError::Closed)
            }
            Err(_) => {
                self.pending.remove(&seq);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Route an inbound reply to its waiting caller. Consumes the frame and
    /// returns `None` when a pending call claimed it; hands the frame back
    /// when nothing is waiting (the caller timed out, or the frame is not a
    /// reply at all).
    pub fn complete(&self, incoming: Incoming) -> Option<Incoming> {
        let seq = incoming.header.seq;
        if seq == 0 || !incoming.header.kind.is_response() {
            return Some(incoming);
        }
        match self.pending.remove(&seq) {
            Some((_, tx)) => {
                if let Err(incoming) = tx.send(incoming) {
                    // Caller gave up between removal and send; drop the frame.
                    drop(incoming);
                }
                None
            }
            None => Some(incoming),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::loopback::LoopbackNet;
    use crate::wire::RequestKind;

    #[tokio::test]
    async fn test_call_completes() {
        let net = LoopbackNet::new();
        let a = TargetId::new();
        let b = TargetId::new();
        let mut inbox_b = net.register(b);
        let mut inbox_a = net.register(a);

        let bundle_a = Bundle::new(net.clone(), 4);
        let rpc_a = RpcClient::new(Arc::clone(&bundle_a), Duration::from_secs(1));

        // Target b: echo a MdResp for every request.
        let net_b = net.clone();
        tokio::spawn(async move {
            while let Some(req) = inbox_b.recv().await {
                let mut resp =
                    Header::new(RequestKind::MdResp, b, &req.header.bucket, 1, &req.header.name);
                resp.seq = req.header.seq;
                resp.meta = b"sidecar".to_vec();
                let _ = net_b.deliver(&req.header.sender, resp, bytes::Bytes::new()).await;
            }
        });

        // Target a: pump replies into the rpc client.
        let rpc = Arc::clone(&rpc_a);
        tokio::spawn(async move {
            while let Some(frame) = inbox_a.recv().await {
                let _ = rpc.complete(frame);
            }
        });

        let header = Header::new(RequestKind::GetMd, a, "bck", 1, "obj");
        let reply = rpc_a.call(b, header).await.unwrap();
        assert_eq!(reply.header.kind, RequestKind::MdResp);
        assert_eq!(reply.header.meta, b"sidecar");
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let net = LoopbackNet::new();
        let a = TargetId::new();
        let b = TargetId::new();
        let _inbox_b = net.register(b); // never answers
        net.register(a);

        let bundle = Bundle::new(net, 4);
        let rpc = RpcClient::new(bundle, Duration::from_millis(50));

        let header = Header::new(RequestKind::GetMd, a, "bck", 1, "obj");
        let err = rpc.call(b, header).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_requests_pass_through_complete() {
        let net = LoopbackNet::new();
        let bundle = Bundle::new(net, 4);
        let rpc = RpcClient::new(bundle, Duration::from_secs(1));

        // An inbound *request* with a nonzero seq must not be swallowed.
        let mut header = Header::new(RequestKind::GetMd, TargetId::new(), "bck", 1, "obj");
        header.seq = 77;
        let frame = Incoming {
            header,
            payload: bytes::Bytes::new(),
        };
        assert!(rpc.complete(frame).is_some());
    }
}
