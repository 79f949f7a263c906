//! Typed checksums for objects and slices.
//!
//! Every metadata sidecar records the checksum of the original object, and
//! each slice sidecar additionally records the checksum of the slice bytes.
//! Values are stored as lowercase hex so the sidecar stays self-describing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use xxhash_rust::xxh64::Xxh64;

/// Supported checksum algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    #[default]
    XxHash64,
    Crc32c,
    Sha256,
}

impl ChecksumType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::XxHash64 => "xxhash64",
            Self::Crc32c => "crc32c",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A checksum value together with the algorithm that produced it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub ty: ChecksumType,
    pub value: String,
}

impl Checksum {
    #[must_use]
    pub const fn new(ty: ChecksumType, value: String) -> Self {
        Self { ty, value }
    }

    /// Compute a checksum over an in-memory buffer.
    #[must_use]
    pub fn compute(ty: ChecksumType, data: &[u8]) -> Self {
        let mut calc = ChecksumCalculator::new(ty);
        calc.update(data);
        calc.finalize()
    }

    /// Verify an in-memory buffer against this checksum.
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(self.ty, data) == *self
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ty, self.value)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ty, self.value)
    }
}

enum CalcState {
    XxHash64(Xxh64),
    Crc32c(u32),
    Sha256(Box<Sha256>),
}

/// Streaming checksum calculator.
///
/// Implements [`io::Write`] so it can sit behind `io::copy` when hashing a
/// reader without buffering it.
pub struct ChecksumCalculator {
    state: CalcState,
}

impl ChecksumCalculator {
    #[must_use]
    pub fn new(ty: ChecksumType) -> Self {
        let state = match ty {
            ChecksumType::XxHash64 => CalcState::XxHash64(Xxh64::new(0)),
            ChecksumType::Crc32c => CalcState::Crc32c(0),
            ChecksumType::Sha256 => CalcState::Sha256(Box::new(Sha256::new())),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            CalcState::XxHash64(h) => h.update(data),
            CalcState::Crc32c(c) => *c = crc32c::crc32c_append(*c, data),
            CalcState::Sha256(h) => h.update(data),
        }
    }

    #[must_use]
    pub fn finalize(self) -> Checksum {
        match self.state {
            CalcState::XxHash64(h) => Checksum::new(
                ChecksumType::XxHash64,
                hex::encode(h.digest().to_be_bytes()),
            ),
            CalcState::Crc32c(c) => {
                Checksum::new(ChecksumType::Crc32c, hex::encode(c.to_be_bytes()))
            }
            CalcState::Sha256(h) => {
                Checksum::new(ChecksumType::Sha256, hex::encode(h.finalize()))
            }
        }
    }
}

impl io::Write for ChecksumCalculator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_verify() {
        let data = b"hello, world!";
        for ty in [ChecksumType::XxHash64, ChecksumType::Crc32c, ChecksumType::Sha256] {
            let ck = Checksum::compute(ty, data);
            assert!(ck.verify(data), "{ty}");
            assert!(!ck.verify(b"hello, world?"), "{ty}");
        }
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let expected = Checksum::compute(ChecksumType::XxHash64, data);

        let mut calc = ChecksumCalculator::new(ChecksumType::XxHash64);
        calc.update(&data[..10]);
        calc.update(&data[10..]);
        assert_eq!(calc.finalize(), expected);
    }

    #[test]
    fn test_serde_roundtrip() {
        let ck = Checksum::compute(ChecksumType::Crc32c, b"abc");
        let json = serde_json::to_string(&ck).unwrap();
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(ck, back);
    }
}
