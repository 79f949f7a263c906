//! Object descriptor: what the external PUT/GET pipeline hands the engine.

use scatterio_common::{Bck, Checksum, ChecksumType, Result, uname};
use scatterio_fs::{ContentType, Mountpath};
use std::path::PathBuf;

/// Identifies one immutable object and carries what the schedulers need:
/// bucket (with EC properties), name, size, checksum, and version. The
/// replica bytes themselves stay on the mountpath.
#[derive(Clone, Debug)]
pub struct ObjectDesc {
    pub bck: Bck,
    pub name: String,
    pub size: u64,
    /// Opaque version string; new writes create a new version.
    pub version: String,
    /// Checksum of the full object as supplied by the writer.
    pub cksum: Checksum,
}

impl ObjectDesc {
    #[must_use]
    pub fn uname(&self) -> String {
        uname(&self.bck.name, &self.name)
    }

    /// Path of the main replica on its mountpath.
    #[must_use]
    pub fn replica_path(&self, mp: &Mountpath) -> PathBuf {
        mp.build_path(&self.bck.name, ContentType::Replica, &self.name)
    }

    /// Build a descriptor from a replica file already present on the
    /// mountpath, computing its checksum.
    pub fn from_replica(
        bck: Bck,
        name: impl Into<String>,
        version: impl Into<String>,
        mp: &Mountpath,
    ) -> Result<Self> {
        let name = name.into();
        let path = mp.build_path(&bck.name, ContentType::Replica, &name);
        let bytes = std::fs::read(&path)?;
        Ok(Self {
            size: bytes.len() as u64,
            cksum: Checksum::compute(ChecksumType::XxHash64, &bytes),
            bck,
            name,
            version: version.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatterio_common::EcConfig;
    use tempfile::tempdir;

    #[test]
    fn test_from_replica() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path()).unwrap();
        mp.write_content("bck", ContentType::Replica, "obj", b"hello world")
            .unwrap();

        let bck = Bck::new("bck", 1, EcConfig::new(4, 2));
        let od = ObjectDesc::from_replica(bck, "obj", "v1", &mp).unwrap();
        assert_eq!(od.size, 11);
        assert_eq!(od.uname(), "bck/obj");
        assert!(od.cksum.verify(b"hello world"));
    }
}
