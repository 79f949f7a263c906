//! Slice payload sources.
//!
//! A slice's bytes may live in an SGL, a whole file, a section of the main
//! replica (zero-padded at the tail), or a scratch workfile. All of them
//! expose the same capability set: open an independent reader, report the
//! size, and release the underlying resource when the last holder lets go.
//! Shared holders are tracked with an atomic refcount so the same file region
//! can back several concurrent sends; a workfile is unlinked when the final
//! reference drops.

use crate::sgl::FrozenSgl;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
enum SliceData {
    /// In-memory segmented buffer.
    Sgl(FrozenSgl),
    /// A whole file owned by someone else (e.g. the main replica).
    File(PathBuf),
    /// A section of a file, padded with zeroes up to `size` bytes.
    FileSection {
        path: PathBuf,
        offset: u64,
        len: u64,
        size: u64,
    },
    /// A scratch workfile owned by this source; unlinked on last release.
    Workfile(PathBuf),
}

#[derive(Debug)]
struct SourceInner {
    data: SliceData,
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        if let SliceData::Workfile(path) = &self.data {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove workfile");
                }
            }
        }
    }
}

/// Refcounted handle to slice bytes.
#[derive(Clone, Debug)]
pub struct SliceSource {
    inner: Arc<SourceInner>,
}

impl SliceSource {
    #[must_use]
    pub fn sgl(sgl: FrozenSgl) -> Self {
        Self::wrap(SliceData::Sgl(sgl))
    }

    #[must_use]
    pub fn file(path: PathBuf) -> Self {
        Self::wrap(SliceData::File(path))
    }

    /// Section `[offset, offset + len)` of `path`, zero-padded to `size`.
    #[must_use]
    pub fn file_section(path: PathBuf, offset: u64, len: u64, size: u64) -> Self {
        debug_assert!(len <= size);
        Self::wrap(SliceData::FileSection {
            path,
            offset,
            len,
            size,
        })
    }

    /// Take ownership of a scratch workfile; it is unlinked when the last
    /// reference is released.
    #[must_use]
    pub fn workfile(path: PathBuf) -> Self {
        Self::wrap(SliceData::Workfile(path))
    }

    fn wrap(data: SliceData) -> Self {
        Self {
            inner: Arc::new(SourceInner { data }),
        }
    }

    /// Add a reference for another concurrent holder (e.g. one more in-flight
    /// send). The pairing release is [`SliceSource::release`].
    #[must_use]
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Drop this reference; the last release frees the backing resource.
    pub fn release(self) {
        drop(self);
    }

    /// Number of live references, for diagnostics.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Payload size in bytes.
    pub fn size(&self) -> io::Result<u64> {
        match &self.inner.data {
            SliceData::Sgl(sgl) => Ok(sgl.len()),
            SliceData::File(path) | SliceData::Workfile(path) => {
                Ok(std::fs::metadata(path)?.len())
            }
            SliceData::FileSection { size, .. } => Ok(*size),
        }
    }

    /// Open an independent reader over the payload.
    pub fn open_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.inner.data {
            SliceData::Sgl(sgl) => Ok(Box::new(sgl.new_reader())),
            SliceData::File(path) | SliceData::Workfile(path) => {
                Ok(Box::new(File::open(path)?))
            }
            SliceData::FileSection {
                path,
                offset,
                len,
                size,
            } => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(*offset))?;
                Ok(Box::new(SectionReader {
                    file,
                    remaining: *len,
                    pad: size - len,
                }))
            }
        }
    }

    /// Read the whole payload into a buffer.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.open_reader()?;
        let mut out = Vec::with_capacity(self.size()? as usize);
        reader.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Reader over a file section followed by zero padding.
struct SectionReader {
    file: File,
    remaining: u64,
    pad: u64,
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining > 0 {
            let take = buf.len().min(self.remaining as usize);
            let n = self.file.read(&mut buf[..take])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file section ended early",
                ));
            }
            self.remaining -= n as u64;
            return Ok(n);
        }
        if self.pad > 0 {
            let take = buf.len().min(self.pad as usize);
            buf[..take].fill(0);
            self.pad -= take as u64;
            return Ok(take);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sgl::Sgl;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_sgl_source() {
        let mut sgl = Sgl::new();
        sgl.write_all(b"abcdef").unwrap();
        let src = SliceSource::sgl(sgl.freeze());
        assert_eq!(src.size().unwrap(), 6);
        assert_eq!(src.read_all().unwrap(), b"abcdef");
    }

    #[test]
    fn test_file_section_with_padding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica");
        std::fs::write(&path, b"0123456789").unwrap();

        // Bytes 4..9 padded out to 8 bytes total.
        let src = SliceSource::file_section(path, 4, 5, 8);
        assert_eq!(src.size().unwrap(), 8);
        assert_eq!(src.read_all().unwrap(), b"45678\0\0\0");
    }

    #[test]
    fn test_workfile_removed_on_last_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch");
        std::fs::write(&path, b"slice bytes").unwrap();

        let src = SliceSource::workfile(path.clone());
        let extra = src.retain();
        assert_eq!(src.ref_count(), 2);

        src.release();
        assert!(path.exists(), "still referenced");

        extra.release();
        assert!(!path.exists(), "last release unlinks the workfile");
    }
}
