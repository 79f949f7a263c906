//! ScatterIO erasure coding — streaming Reed-Solomon over readers and writers.
//!
//! The codec never buffers a whole object: data slices are presented as
//! readers (file sections, workfiles, or in-memory segmented buffers) and
//! parity is produced chunk by chunk into writers. The same shape drives
//! reconstruction, so a restore can run off whichever mix of memory and disk
//! sources survived.

pub mod codec;
pub mod sgl;
pub mod source;

pub use codec::{CHUNK_SIZE, CODEC_ALIGN, ErasureError, StreamCodec, slice_size_for};
pub use sgl::{FrozenSgl, MemBudget, MemReservation, Sgl, SglReader};
pub use source::SliceSource;

use scatterio_common::EcError;

impl From<ErasureError> for EcError {
    fn from(e: ErasureError) -> Self {
        match e {
            ErasureError::InsufficientSlices { have, need } => {
                Self::InsufficientSlices { have, need }
            }
            ErasureError::Io(io) => io.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}
