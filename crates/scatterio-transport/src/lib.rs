//! ScatterIO transport — the wire layer between storage targets.
//!
//! Two logical channels share one framed link per peer:
//! - the **data bundle** streams slice/replica payloads one-way with a
//!   per-send completion callback and a per-destination parallelism cap;
//! - the **small-RPC client** correlates control requests (metadata fetch,
//!   delete) with their responses by sequence number.
//!
//! Delivery is at-most-once with loss-visible errors; the bundle never
//! retries — callers own the retry policy.

pub mod bundle;
pub mod link;
pub mod loopback;
pub mod rpc;
pub mod tcp;
pub mod wire;

pub use bundle::{Bundle, SendCb};
pub use link::{Incoming, Link};
pub use loopback::LoopbackNet;
pub use rpc::RpcClient;
pub use tcp::TcpLink;
pub use wire::{Header, MAX_HEADER_BYTES, RequestKind, read_frame, write_frame};

use scatterio_common::EcError;
use thiserror::Error;

/// Wire-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("frame exceeds limits: {0}")]
    FrameTooLarge(String),

    #[error("no route to target {0}")]
    PeerUnknown(String),

    #[error("channel closed")]
    Closed,

    #[error("request timed out")]
    Timeout,
}

impl From<TransportError> for EcError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Self::Timeout("peer request".into()),
            other => Self::Transport(other.to_string()),
        }
    }
}
