//! Link abstraction: anything that can move a frame to a peer.

use crate::{TransportError, wire::Header};
use async_trait::async_trait;
use bytes::Bytes;
use scatterio_common::TargetId;

/// A frame as it arrives at a target.
#[derive(Debug)]
pub struct Incoming {
    pub header: Header,
    pub payload: Bytes,
}

/// One-way frame delivery to a peer.
///
/// Implementations: [`crate::LoopbackNet`] for in-process clusters and tests,
/// [`crate::TcpLink`] for real deployments.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn deliver(
        &self,
        to: &TargetId,
        header: Header,
        payload: Bytes,
    ) -> Result<(), TransportError>;
}
