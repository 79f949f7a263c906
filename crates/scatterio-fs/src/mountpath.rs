//! Mountpath operations: path building/parsing, workfiles, atomic renames.

use crate::content::ContentType;
use scatterio_common::{EcError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

/// One local filesystem root owned by this target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpath {
    root: PathBuf,
}

impl Mountpath {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for a content file.
    #[must_use]
    pub fn build_path(&self, bucket: &str, ct: ContentType, name: &str) -> PathBuf {
        self.root.join(bucket).join(ct.dir()).join(name)
    }

    /// Inverse of [`Mountpath::build_path`].
    pub fn parse_path(&self, path: &Path) -> Result<(String, ContentType, String)> {
        let rel = path.strip_prefix(&self.root).map_err(|_| {
            EcError::internal(format!(
                "path {} is not under mountpath {}",
                path.display(),
                self.root.display()
            ))
        })?;

        let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
        let [bucket, ct_dir, name] = parts.as_slice() else {
            return Err(EcError::internal(format!(
                "malformed content path: {}",
                path.display()
            )));
        };
        let ct = ContentType::from_dir(ct_dir).ok_or_else(|| {
            EcError::internal(format!("unknown content directory: {ct_dir}"))
        })?;
        Ok(((*bucket).to_string(), ct, (*name).to_string()))
    }

    #[must_use]
    pub fn exists(&self, bucket: &str, ct: ContentType, name: &str) -> bool {
        self.build_path(bucket, ct, name).is_file()
    }

    /// Create a scratch workfile with a unique suffix. Returns the path and
    /// the open handle.
    pub fn create_workfile(&self, bucket: &str, name: &str) -> Result<(PathBuf, File)> {
        let dir = self.root.join(bucket).join(ContentType::Work.dir());
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.{}", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok((path, file))
    }

    /// Move a fully written workfile into its final content location.
    ///
    /// The caller must have synced the file contents; this renames and then
    /// syncs the destination directory so the entry survives a crash.
    pub fn rename_atomic(
        &self,
        workfile: &Path,
        bucket: &str,
        ct: ContentType,
        name: &str,
    ) -> Result<PathBuf> {
        let dest = self.build_path(bucket, ct, name);
        let parent = dest
            .parent()
            .ok_or_else(|| EcError::internal("content path has no parent"))?;
        fs::create_dir_all(parent)?;
        fs::rename(workfile, &dest)?;
        File::open(parent)?.sync_all()?;
        Ok(dest)
    }

    /// Write a content file atomically: workfile, fsync, rename.
    pub fn write_content(
        &self,
        bucket: &str,
        ct: ContentType,
        name: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        let (work_path, mut file) = self.create_workfile(bucket, name)?;
        let res: Result<()> = (|| {
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = res {
            let _ = fs::remove_file(&work_path);
            return Err(e);
        }
        drop(file);
        self.rename_atomic(&work_path, bucket, ct, name)
    }

    /// Remove a content file. Returns whether anything was removed.
    pub fn remove(&self, bucket: &str, ct: ContentType, name: &str) -> Result<bool> {
        let path = self.build_path(bucket, ct, name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List the names of all content files of one type in a bucket.
    pub fn list_content(&self, bucket: &str, ct: ContentType) -> Result<Vec<String>> {
        let dir = self.root.join(bucket).join(ct.dir());
        let mut names = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// List the buckets that have any content on this mountpath.
    pub fn list_buckets(&self) -> Result<Vec<String>> {
        let mut buckets = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(buckets),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    buckets.push(name);
                }
            }
        }
        buckets.sort();
        Ok(buckets)
    }
}

/// The set of mountpaths owned by one target.
#[derive(Debug, Clone)]
pub struct Mountpaths {
    paths: Vec<Arc<Mountpath>>,
}

impl Mountpaths {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Result<Self> {
        let mut paths = Vec::new();
        for root in roots {
            paths.push(Arc::new(Mountpath::new(root)?));
        }
        if paths.is_empty() {
            return Err(EcError::InvalidConfig("no mountpaths configured".into()));
        }
        Ok(Self { paths })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mountpath>> {
        self.paths.iter()
    }

    /// The mountpath that owns `uname` on this target. Stable for a fixed
    /// mountpath set.
    #[must_use]
    pub fn owner(&self, uname: &str) -> &Arc<Mountpath> {
        let idx = (xxh64(uname.as_bytes(), 0) % self.paths.len() as u64) as usize;
        &self.paths[idx]
    }

    /// Index of the owning mountpath, used to address per-mountpath workers.
    #[must_use]
    pub fn owner_index(&self, uname: &str) -> usize {
        (xxh64(uname.as_bytes(), 0) % self.paths.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_parse_roundtrip() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path()).unwrap();

        for ct in ContentType::ALL {
            let path = mp.build_path("bck", ct, "obj-1");
            let (bucket, parsed_ct, name) = mp.parse_path(&path).unwrap();
            assert_eq!(bucket, "bck");
            assert_eq!(parsed_ct, ct);
            assert_eq!(name, "obj-1");
        }
    }

    #[test]
    fn test_parse_rejects_foreign_path() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path().join("a")).unwrap();
        assert!(mp.parse_path(Path::new("/elsewhere/bck/obj/x")).is_err());
        assert!(
            mp.parse_path(&mp.root().join("bck").join("weird").join("x"))
                .is_err()
        );
    }

    #[test]
    fn test_write_content_and_list() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path()).unwrap();

        mp.write_content("bck", ContentType::Replica, "a", b"AAAA").unwrap();
        mp.write_content("bck", ContentType::Replica, "b", b"BBBB").unwrap();
        mp.write_content("bck", ContentType::Meta, "a", b"{}").unwrap();

        assert_eq!(mp.list_content("bck", ContentType::Replica).unwrap(), ["a", "b"]);
        assert_eq!(mp.list_content("bck", ContentType::Meta).unwrap(), ["a"]);
        assert_eq!(mp.list_content("bck", ContentType::Slice).unwrap(), Vec::<String>::new());
        assert_eq!(mp.list_buckets().unwrap(), ["bck"]);

        // Workfiles never linger after a rename.
        assert_eq!(mp.list_content("bck", ContentType::Work).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        let mp = Mountpath::new(dir.path()).unwrap();
        assert!(!mp.remove("bck", ContentType::Replica, "nope").unwrap());
    }

    #[test]
    fn test_owner_is_stable() {
        let dir = tempdir().unwrap();
        let mps = Mountpaths::new([
            dir.path().join("mp0"),
            dir.path().join("mp1"),
            dir.path().join("mp2"),
        ])
        .unwrap();
        let a = mps.owner("bck/obj-7").root().to_path_buf();
        let b = mps.owner("bck/obj-7").root().to_path_buf();
        assert_eq!(a, b);
        assert_eq!(mps.owner_index("bck/obj-7"), mps.owner_index("bck/obj-7"));
    }
}
