//! Segmented growable buffers and the shared memory budget.
//!
//! An [`Sgl`] is the in-memory materialization of a slice: a chain of
//! fixed-size segments written through `io::Write`. Handles are cheap clones
//! of the same buffer, so a scheduler can hand a boxed writer to the codec
//! and still [`Sgl::freeze`] the accumulated bytes afterwards. Segments avoid
//! the reallocation churn of a single growing `Vec` when slices run to
//! megabytes.
//!
//! The [`MemBudget`] is the engine-wide gate that decides whether slices are
//! materialized in memory or spilled to workfiles. Reservations are RAII:
//! dropping a [`MemReservation`] returns the bytes, so error paths cannot
//! leak budget.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of one SGL segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Engine-wide accounting of slice buffer memory.
#[derive(Debug)]
pub struct MemBudget {
    capacity: u64,
    used: AtomicU64,
}

impl MemBudget {
    #[must_use]
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicU64::new(0),
        })
    }

    /// Try to reserve `n` bytes; `None` means the caller must spill to disk.
    #[must_use]
    pub fn try_reserve(self: &Arc<Self>, n: u64) -> Option<MemReservation> {
        let prev = self.used.fetch_add(n, Ordering::AcqRel);
        if prev + n > self.capacity {
            self.used.fetch_sub(n, Ordering::AcqRel);
            return None;
        }
        Some(MemReservation {
            budget: Arc::clone(self),
            n,
        })
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// RAII handle for reserved budget bytes; dropping releases them.
#[derive(Debug)]
pub struct MemReservation {
    budget: Arc<MemBudget>,
    n: u64,
}

impl MemReservation {
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.n
    }
}

impl Drop for MemReservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.n, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct SglBuf {
    segments: Vec<Bytes>,
    current: BytesMut,
    len: u64,
}

/// Write-side of a segmented growable buffer. Clones share the buffer.
#[derive(Clone, Debug, Default)]
pub struct Sgl {
    buf: Arc<Mutex<SglBuf>>,
}

impl Sgl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.buf.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the accumulated bytes into an immutable, shareable form.
    #[must_use]
    pub fn freeze(&self) -> FrozenSgl {
        let mut buf = self.buf.lock();
        if !buf.current.is_empty() {
            let full = buf.current.split();
            buf.segments.push(full.freeze());
        }
        FrozenSgl {
            inner: Arc::new(SglData {
                segments: buf.segments.clone(),
                len: buf.len,
            }),
        }
    }
}

impl Write for Sgl {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.buf.lock();
        let mut rest = data;
        while !rest.is_empty() {
            let room = SEGMENT_SIZE - buf.current.len();
            let take = room.min(rest.len());
            buf.current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if buf.current.len() == SEGMENT_SIZE {
                let full = buf.current.split();
                buf.segments.push(full.freeze());
            }
        }
        buf.len += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct SglData {
    segments: Vec<Bytes>,
    len: u64,
}

/// Immutable, shareable segmented buffer.
#[derive(Clone, Debug)]
pub struct FrozenSgl {
    inner: Arc<SglData>,
}

impl FrozenSgl {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Open a fresh reader over the whole buffer.
    #[must_use]
    pub fn new_reader(&self) -> SglReader {
        SglReader {
            data: Arc::clone(&self.inner),
            segment: 0,
            offset: 0,
        }
    }

    /// Copy the contents into one contiguous `Bytes`.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.inner.len as usize);
        for seg in &self.inner.segments {
            out.extend_from_slice(seg);
        }
        out.freeze()
    }
}

impl From<Bytes> for FrozenSgl {
    fn from(b: Bytes) -> Self {
        let len = b.len() as u64;
        Self {
            inner: Arc::new(SglData {
                segments: vec![b],
                len,
            }),
        }
    }
}

/// Reader over a [`FrozenSgl`]; each reader tracks its own position.
#[derive(Debug)]
pub struct SglReader {
    data: Arc<SglData>,
    segment: usize,
    offset: usize,
}

impl Read for SglReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.segment < self.data.segments.len() {
            let seg = &self.data.segments[self.segment];
            if self.offset < seg.len() {
                let take = buf.len().min(seg.len() - self.offset);
                buf[..take].copy_from_slice(&seg[self.offset..self.offset + take]);
                self.offset += take;
                return Ok(take);
            }
            self.segment += 1;
            self.offset = 0;
        }
        Ok(0)
    }
}
