//! Per-bucket erasure-coding configuration.

use serde::{Deserialize, Serialize};

/// Maximum number of data or parity slices.
pub const MAX_SLICES: u8 = 32;

/// Compression hint carried through transport headers. The engine does not
/// compress; the hint is advisory metadata for the wire layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionHint {
    Always,
    Never,
    #[default]
    SizeBased,
}

/// Erasure-coding properties of a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConfig {
    /// Whether EC protection is enabled for the bucket.
    pub enabled: bool,
    /// Number of data slices (1..=32).
    pub data_slices: u8,
    /// Number of parity slices (1..=32).
    pub parity_slices: u8,
    /// Objects at or below this size are replicated instead of encoded.
    pub objsize_limit: u64,
    /// Size of one background re-encode batch (4..=128).
    pub batch_size: u32,
    /// Compression hint for the wire layer.
    #[serde(default)]
    pub compression: CompressionHint,
    /// Force disk materialization of slices, skipping memory mode.
    #[serde(default)]
    pub disk_only: bool,
}

impl EcConfig {
    /// Create an enabled config with the given slice counts and defaults for
    /// the rest.
    #[must_use]
    pub fn new(data_slices: u8, parity_slices: u8) -> Self {
        Self {
            enabled: true,
            data_slices,
            parity_slices,
            ..Self::default()
        }
    }

    /// Total number of slices produced for an encoded object.
    #[must_use]
    pub const fn total_slices(&self) -> usize {
        self.data_slices as usize + self.parity_slices as usize
    }

    /// Number of copies kept for a replicated object (main + parity extras).
    #[must_use]
    pub const fn replica_count(&self) -> usize {
        self.parity_slices as usize + 1
    }

    /// Whether an object of `size` bytes takes the replicated path.
    #[must_use]
    pub const fn replicate(&self, size: u64) -> bool {
        size <= self.objsize_limit || self.data_slices == 1
    }

    /// Validate the parameter ranges.
    pub fn validate(&self) -> Result<(), EcConfigError> {
        if self.data_slices == 0 || self.data_slices > MAX_SLICES {
            return Err(EcConfigError::DataSlices(self.data_slices));
        }
        if self.parity_slices == 0 || self.parity_slices > MAX_SLICES {
            return Err(EcConfigError::ParitySlices(self.parity_slices));
        }
        if !(4..=128).contains(&self.batch_size) {
            return Err(EcConfigError::BatchSize(self.batch_size));
        }
        Ok(())
    }
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_slices: 4,
            parity_slices: 2,
            objsize_limit: 256 * 1024,
            batch_size: 16,
            compression: CompressionHint::SizeBased,
            disk_only: false,
        }
    }
}

/// Errors from [`EcConfig::validate`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum EcConfigError {
    #[error("data_slices must be in 1..=32, got {0}")]
    DataSlices(u8),
    #[error("parity_slices must be in 1..=32, got {0}")]
    ParitySlices(u8),
    #[error("batch_size must be in 4..=128, got {0}")]
    BatchSize(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ranges() {
        assert!(EcConfig::new(4, 2).validate().is_ok());
        assert!(EcConfig::new(0, 2).validate().is_err());
        assert!(EcConfig::new(4, 33).validate().is_err());

        let mut cfg = EcConfig::new(4, 2);
        cfg.batch_size = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_replicate_decision() {
        let cfg = EcConfig {
            objsize_limit: 1024,
            ..EcConfig::new(4, 2)
        };
        assert!(cfg.replicate(1024));
        assert!(!cfg.replicate(1025));

        // A single data slice always replicates, regardless of size.
        let single = EcConfig::new(1, 2);
        assert!(single.replicate(u64::MAX));
    }
}
