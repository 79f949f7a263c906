//! Slice metadata sidecars.
//!
//! A sidecar lives next to every replica and slice; a payload file without
//! its sidecar is garbage and is deleted by the next scan. The sidecar is
//! self-describing JSON — readers ignore unknown fields, so old engines can
//! open sidecars written by newer ones. Writing the sidecar is the commit
//! point of every put: it goes to disk strictly after the payload bytes are
//! synced and renamed into place.

use crate::object::ObjectDesc;
use scatterio_common::{Checksum, EcError, Result};
use scatterio_fs::{ContentType, Mountpath};
use serde::{Deserialize, Serialize};

/// Per-slice metadata persisted alongside every replica and slice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMeta {
    /// Original object size in bytes.
    pub size: u64,
    /// EC parameters at encode time.
    pub data: u8,
    pub parity: u8,
    /// True iff the object was replicated rather than erasure-coded.
    pub is_copy: bool,
    /// 0 for the main replica and for replicated copies; 1..=data+parity for
    /// slices.
    pub slice_id: u16,
    /// Checksum of the original object; identical in every sidecar of the
    /// same (object, version).
    pub obj_cksum: Checksum,
    /// Checksum of this slice's bytes. Unset for replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_cksum: Option<Checksum>,
    /// Object version; must agree across all sidecars of the same object.
    #[serde(default)]
    pub obj_version: String,
    /// Bucket generation id, to detect artifacts of a re-created bucket.
    pub bucket_id: u64,
}

impl SliceMeta {
    /// Sidecar for the main replica (slice 0).
    #[must_use]
    pub fn main(od: &ObjectDesc, is_copy: bool) -> Self {
        Self {
            size: od.size,
            data: od.bck.props.data_slices,
            parity: od.bck.props.parity_slices,
            is_copy,
            slice_id: 0,
            obj_cksum: od.cksum.clone(),
            slice_cksum: None,
            obj_version: od.version.clone(),
            bucket_id: od.bck.id,
        }
    }

    /// Sidecar for slice `slice_id` with its own checksum.
    #[must_use]
    pub fn clone_for_slice(&self, slice_id: u16, slice_cksum: Checksum) -> Self {
        Self {
            slice_id,
            slice_cksum: Some(slice_cksum),
            is_copy: false,
            ..self.clone()
        }
    }

    /// Sidecar for a replicated copy on a peer.
    #[must_use]
    pub fn clone_for_copy(&self) -> Self {
        Self {
            slice_id: 0,
            slice_cksum: None,
            is_copy: true,
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn total_slices(&self) -> usize {
        self.data as usize + self.parity as usize
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EcError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| EcError::Serialization(e.to_string()))
    }

    /// Load the sidecar for `(bucket, name)` on a mountpath, if present and
    /// parseable.
    pub fn load(mp: &Mountpath, bucket: &str, name: &str) -> Result<Option<Self>> {
        let path = mp.build_path(bucket, ContentType::Meta, name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(Self::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the sidecar. This is the commit point: callers invoke it only
    /// after the payload file is synced and renamed.
    pub fn store(&self, mp: &Mountpath, bucket: &str, name: &str) -> Result<()> {
        let bytes = self.to_bytes()?;
        mp.write_content(bucket, ContentType::Meta, name, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatterio_common::{Bck, ChecksumType, EcConfig};
    use tempfile::tempdir;

    fn sample_od() -> ObjectDesc {
        ObjectDesc {
            bck: Bck::new("bck", 11, EcConfig::new(4, 2)),
            name: "obj".into(),
            size: 1000,
            version: "v1".into(),
            cksum: Checksum::compute(ChecksumType::XxHash64, b"payload"),
        }
    }

    #[test]
    fn test_main_and_slice_clone() {
        let od = sample_od();
        let md = SliceMeta::main(&od, false);
        assert_eq!(md.slice_id, 0);
        assert_eq!(md.total_slices(), 6);
        assert_eq!(md.bucket_id, 11);

        let sck = Checksum::compute(ChecksumType::XxHash64, b"slice");
        let s3 = md.clone_for_slice(3, sck.clone());
        assert_eq!(s3.slice_id, 3);
        assert_eq!(s3.slice_cksum, Some(sck));
        assert_eq!(s3.obj_cksum, md.obj_cksum);
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path()).unwrap();
        let md = SliceMeta::main(&sample_od(), true);

        md.store(&mp, "bck", "obj").unwrap();
        let back = SliceMeta::load(&mp, "bck", "obj").unwrap().unwrap();
        assert_eq!(back, md);

        assert!(SliceMeta::load(&mp, "bck", "missing").unwrap().is_none());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let od = sample_od();
        let md = SliceMeta::main(&od, false);
        let mut value: serde_json::Value = serde_json::to_value(&md).unwrap();
        value["future_field"] = serde_json::json!({"nested": true});

        let bytes = serde_json::to_vec(&value).unwrap();
        let back = SliceMeta::from_bytes(&bytes).unwrap();
        assert_eq!(back, md);
    }
}
