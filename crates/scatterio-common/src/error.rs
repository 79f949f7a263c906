//! Error taxonomy for the erasure-coding engine.

use thiserror::Error;

/// Common result type for engine operations.
pub type Result<T> = std::result::Result<T, EcError>;

/// Engine-wide error type.
///
/// Caller-facing failures carry a kind plus a short human description; the
/// engine never puts stack traces on the wire.
#[derive(Debug, Error)]
pub enum EcError {
    /// The bucket has EC disabled; the caller falls back to plain I/O.
    #[error("erasure coding disabled for bucket {0}")]
    Disabled(String),

    /// Not enough active targets to place all copies or slices.
    #[error("insufficient targets: have {have}, need {need}")]
    InsufficientTargets { have: usize, need: usize },

    /// Fewer than `data` slices survive; the object cannot be rebuilt.
    #[error("insufficient slices to restore: have {have}, need {need}")]
    InsufficientSlices { have: usize, need: usize },

    /// No target holds a metadata sidecar for the object.
    #[error("no metadata sidecar found for {0}")]
    NoMetafile(String),

    /// Payload checksum mismatch.
    #[error("checksum mismatch: {0}")]
    BadChecksum(String),

    /// The local filesystem is full.
    #[error("out of space: {0}")]
    OutOfSpace(#[source] std::io::Error),

    /// A broadcast or slice fetch exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Wire-layer failure surfaced by the transport bundle.
    #[error("transport error: {0}")]
    Transport(String),

    /// Local disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Sidecar or wire (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid EC parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invariant violation; should not occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EcError {
    /// Short stable name of the error kind, for logs and wire responses.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Disabled(_) => "ec_disabled",
            Self::InsufficientTargets { .. } => "insufficient_targets",
            Self::InsufficientSlices { .. } => "insufficient_slices",
            Self::NoMetafile(_) => "no_metafile",
            Self::BadChecksum(_) => "bad_checksum",
            Self::OutOfSpace(_) => "out_of_space",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a future attempt may succeed without operator action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

impl From<std::io::Error> for EcError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                Self::OutOfSpace(e)
            }
            _ => Self::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            EcError::InsufficientSlices { have: 3, need: 4 }.kind(),
            "insufficient_slices"
        );
        assert_eq!(EcError::NoMetafile("b/o".into()).kind(), "no_metafile");
    }

    #[test]
    fn test_enospc_maps_to_out_of_space() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        assert!(matches!(EcError::from(io), EcError::OutOfSpace(_)));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(EcError::from(io), EcError::Io(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(EcError::Timeout("md gather".into()).is_retryable());
        assert!(!EcError::BadChecksum("slice 3".into()).is_retryable());
    }
}
