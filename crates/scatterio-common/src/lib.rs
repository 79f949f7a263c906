//! ScatterIO common — shared types for the erasure-coding engine.
//!
//! Everything here is dependency-light on purpose: identifiers, checksums,
//! per-bucket EC configuration, the engine error taxonomy, and the cheap
//! atomic counters the schedulers bump.

pub mod checksum;
pub mod config;
pub mod error;
pub mod stats;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator, ChecksumType};
pub use config::{CompressionHint, EcConfig};
pub use error::{EcError, Result};
pub use stats::{EcStats, StatsSnapshot};
pub use types::{Bck, ObjectName, TargetId, uname};
