//! ScatterIO engine — erasure-coded protection for immutable objects.
//!
//! The engine splits each object into data slices, computes parity, scatters
//! the slices across the cluster with a deterministic placement, and rebuilds
//! the object from whichever slices survive a failure. Small objects are
//! replicated instead of encoded.
//!
//! One [`Engine`] handle per target, created at startup with its collaborator
//! interfaces injected (cluster map view, mountpaths, wire link); the handle
//! owns the per-mountpath put/get schedulers and the per-bucket responders.
//! There are no hidden globals.
//!
//! Data flows PUT → encoder → bundle → peers; restore flows peers → metadata
//! gather → slice gather → decoder → local replica.

pub mod engine;
pub mod meta;
pub mod object;
pub mod scrub;

mod get;
mod put;
mod respond;

pub use engine::{Engine, EngineConfig};
pub use meta::SliceMeta;
pub use object::ObjectDesc;
pub use scrub::ScrubReport;

pub use scatterio_common::{Bck, Checksum, ChecksumType, EcConfig, EcError, Result, TargetId};
