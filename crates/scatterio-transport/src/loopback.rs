//! In-process link: frames move between registered targets over channels.
//!
//! Used by tests and single-binary clusters; the framing and routing logic
//! above it is identical to the TCP path.

use crate::{TransportError, link::{Incoming, Link}, wire::Header};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use scatterio_common::TargetId;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Router connecting every in-process target.
#[derive(Debug, Default)]
pub struct LoopbackNet {
    inboxes: DashMap<TargetId, mpsc::UnboundedSender<Incoming>>,
}

impl LoopbackNet {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a target and obtain its inbox.
    #[must_use]
    pub fn register(&self, id: TargetId) -> mpsc::UnboundedReceiver<Incoming> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id, tx);
        rx
    }

    /// Drop a target; subsequent sends to it fail loss-visibly.
    pub fn unregister(&self, id: &TargetId) {
        self.inboxes.remove(id);
    }
}

#[async_trait]
impl Link for LoopbackNet {
    async fn deliver(
        &self,
        to: &TargetId,
        header: Header,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let tx = self
            .inboxes
            .get(to)
            .ok_or_else(|| TransportError::PeerUnknown(to.to_string()))?
            .clone();
        tx.send(Incoming { header, payload })
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestKind;

    #[tokio::test]
    async fn test_deliver_and_unregister() {
        let net = LoopbackNet::new();
        let a = TargetId::new();
        let b = TargetId::new();
        let mut inbox_b = net.register(b);
        net.register(a);

        let header = Header::new(RequestKind::GetMd, a, "bck", 1, "obj");
        net.deliver(&b, header, Bytes::new()).await.unwrap();

        let got = inbox_b.recv().await.unwrap();
        assert_eq!(got.header.sender, a);
        assert_eq!(got.header.kind, RequestKind::GetMd);

        net.unregister(&b);
        let header = Header::new(RequestKind::GetMd, a, "bck", 1, "obj");
        assert!(matches!(
            net.deliver(&b, header, Bytes::new()).await,
            Err(TransportError::PeerUnknown(_))
        ));
    }
}
