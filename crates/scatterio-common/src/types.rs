//! Core identifiers for the erasure-coding engine.

use crate::config::EcConfig;
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a storage target (one cluster node).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct TargetId(Uuid);

impl TargetId {
    /// Generate a new random target ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetId({})", self.0)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object name within a bucket.
///
/// Names are opaque to the engine apart from the single constraint that they
/// map to one filesystem path component per content type.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectName(String);

impl ObjectName {
    pub fn new(name: impl Into<String>) -> Result<Self, ObjectNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ObjectNameError::Empty);
        }
        if name.len() > 1024 {
            return Err(ObjectNameError::TooLong);
        }
        if name.contains('/') || name.contains('\0') {
            return Err(ObjectNameError::InvalidChar);
        }
        Ok(Self(name))
    }

    /// Create without validation (internal use only).
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({:?})", self.0)
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur when creating an object name.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectNameError {
    #[error("object name cannot be empty")]
    Empty,
    #[error("object name cannot exceed 1024 bytes")]
    TooLong,
    #[error("object name contains an invalid character")]
    InvalidChar,
}

/// Bucket descriptor as the engine sees it: a name, a cluster-unique id that
/// changes when the bucket is destroyed and re-created, and the EC properties
/// in force at encode time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    /// Unique bucket generation id; stale artifacts are detected by comparing
    /// the id recorded in a metadata sidecar against the live bucket.
    pub id: u64,
    pub props: EcConfig,
}

impl Bck {
    #[must_use]
    pub fn new(name: impl Into<String>, id: u64, props: EcConfig) -> Self {
        Self {
            name: name.into(),
            id,
            props,
        }
    }

    /// Cluster-wide unique name for an object in this bucket.
    #[must_use]
    pub fn make_uname(&self, obj_name: &str) -> String {
        uname(&self.name, obj_name)
    }
}

/// Canonical `bucket/object` form used for placement hashing and routing keys.
#[must_use]
pub fn uname(bucket: &str, obj_name: &str) -> String {
    format!("{bucket}/{obj_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_id_roundtrip() {
        let id = TargetId::new();
        assert_eq!(TargetId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_object_name_valid() {
        assert!(ObjectName::new("a/b").is_err());
        assert!(ObjectName::new("").is_err());
        assert!(ObjectName::new("shard-0001.bin").is_ok());
    }

    #[test]
    fn test_uname() {
        let bck = Bck::new("media", 7, EcConfig::default());
        assert_eq!(bck.make_uname("img.jpg"), "media/img.jpg");
    }
}
