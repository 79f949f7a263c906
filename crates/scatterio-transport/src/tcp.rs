//! TCP link: length-delimited frames over pooled connections.

use crate::{
    TransportError,
    link::{Incoming, Link},
    wire::{Header, read_frame, write_frame},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use scatterio_common::TargetId;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Outbound side: one pooled connection per destination, opened on demand.
#[derive(Debug, Default)]
pub struct TcpLink {
    addrs: DashMap<TargetId, String>,
    conns: DashMap<TargetId, Arc<Mutex<OwnedWriteHalf>>>,
}

impl TcpLink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install or refresh the wire address of a peer (from the cluster map).
    pub fn set_addr(&self, id: TargetId, addr: impl Into<String>) {
        self.addrs.insert(id, addr.into());
    }

    pub fn forget(&self, id: &TargetId) {
        self.addrs.remove(id);
        self.conns.remove(id);
    }

    async fn writer(&self, to: &TargetId) -> Result<Arc<Mutex<OwnedWriteHalf>>, TransportError> {
        if let Some(conn) = self.conns.get(to) {
            return Ok(Arc::clone(&conn));
        }
        let addr = self
            .addrs
            .get(to)
            .ok_or_else(|| TransportError::PeerUnknown(to.to_string()))?
            .clone();
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = %to, %addr, "connected");
        let (read_half, write_half) = stream.into_split();
        // The pooled connection is send-only; drain and discard anything the
        // peer writes back on it.
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut sink = [0u8; 4096];
            loop {
                match tokio::io::AsyncReadExt::read(&mut read_half, &mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
        let writer = Arc::new(Mutex::new(write_half));
        self.conns.insert(*to, Arc::clone(&writer));
        Ok(writer)
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn deliver(
        &self,
        to: &TargetId,
        header: Header,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let writer = self.writer(to).await?;
        let mut guard = writer.lock().await;
        if let Err(e) = write_frame(&mut *guard, &header, &payload).await {
            // A broken pipe invalidates the pooled connection; the next send
            // reconnects.
            drop(guard);
            self.conns.remove(to);
            return Err(e);
        }
        Ok(())
    }
}

/// Inbound side: accept loop feeding decoded frames into `tx`.
///
/// Runs until the listener errors or `tx` closes; spawn it once per target.
pub async fn serve(listener: TcpListener, tx: mpsc::UnboundedSender<Incoming>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "inbound connection");
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                match read_frame(&mut stream).await {
                    Ok(Some((header, payload))) => {
                        if tx.send(Incoming { header, payload }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(%peer, error = %e, "frame decode failed, dropping connection");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestKind;

    #[tokio::test]
    async fn test_tcp_deliver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, tx));

        let a = TargetId::new();
        let b = TargetId::new();
        let link = TcpLink::new();
        link.set_addr(b, addr.to_string());

        let mut header = Header::new(RequestKind::PutReplica, a, "bck", 1, "obj");
        header.size = 4;
        link.deliver(&b, header, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.header.sender, a);
        assert_eq!(&got.payload[..], b"data");

        // Unknown peer is loss-visible.
        let c = TargetId::new();
        let header = Header::new(RequestKind::Del, a, "bck", 1, "obj");
        assert!(matches!(
            link.deliver(&c, header, Bytes::new()).await,
            Err(TransportError::PeerUnknown(_))
        ));
    }
}
