//! Chunked streaming Reed-Solomon encode and reconstruct.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use std::io::{Read, Write};
use thiserror::Error;

/// Slice sizes are rounded up to this alignment so every chunk the codec
/// touches has an even byte length, as the SIMD backend requires.
pub const CODEC_ALIGN: u64 = 64;

/// Bytes of each slice processed per codec pass. Multiple of [`CODEC_ALIGN`].
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Errors specific to erasure coding operations.
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid codec parameters: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("reconstruction failed: {0}")]
    ReconstructFailed(String),

    #[error("insufficient slices: have {have}, need {need}")]
    InsufficientSlices { have: usize, need: usize },

    #[error("slice I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, ErasureError>;

/// Compute the on-disk slice size for an object of `obj_size` bytes split
/// into `data` slices: `ceil(obj_size / data)` rounded up to [`CODEC_ALIGN`],
/// minimum one alignment unit. The tail of the last data slice is zero-padded
/// to this size; a restore truncates back to the recorded object size.
#[must_use]
pub fn slice_size_for(obj_size: u64, data: usize) -> u64 {
    let raw = obj_size.div_ceil(data as u64).max(1);
    raw.div_ceil(CODEC_ALIGN) * CODEC_ALIGN
}

/// Streaming Reed-Solomon codec for a fixed `(data, parity)` geometry.
pub struct StreamCodec {
    data: usize,
    parity: usize,
}

impl StreamCodec {
    pub fn new(data: usize, parity: usize) -> Result<Self> {
        if data == 0 || parity == 0 {
            return Err(ErasureError::InvalidConfig(
                "data and parity slice counts must be > 0".into(),
            ));
        }
        if data + parity > 255 {
            return Err(ErasureError::InvalidConfig(
                "total slices must be <= 255".into(),
            ));
        }
        Ok(Self { data, parity })
    }

    #[must_use]
    pub const fn data_slices(&self) -> usize {
        self.data
    }

    #[must_use]
    pub const fn parity_slices(&self) -> usize {
        self.parity
    }

    #[must_use]
    pub const fn total_slices(&self) -> usize {
        self.data + self.parity
    }

    /// Encode: consume `data` readers of exactly `slice_size` bytes each and
    /// produce `parity` writers of the same length.
    pub fn encode(
        &self,
        data_readers: &mut [Box<dyn Read + Send>],
        parity_writers: &mut [Box<dyn Write + Send>],
        slice_size: u64,
    ) -> Result<()> {
        if data_readers.len() != self.data {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} data readers, got {}",
                self.data,
                data_readers.len()
            )));
        }
        if parity_writers.len() != self.parity {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} parity writers, got {}",
                self.parity,
                parity_writers.len()
            )));
        }

        let mut bufs = vec![vec![0u8; CHUNK_SIZE]; self.data];
        let mut remaining = slice_size;

        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE as u64) as usize;

            for (reader, buf) in data_readers.iter_mut().zip(bufs.iter_mut()) {
                reader.read_exact(&mut buf[..n])?;
            }

            let mut encoder = ReedSolomonEncoder::new(self.data, self.parity, n)
                .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
            for buf in &bufs {
                encoder
                    .add_original_shard(&buf[..n])
                    .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
            }
            let result = encoder
                .encode()
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

            for (writer, recovery) in parity_writers.iter_mut().zip(result.recovery_iter()) {
                writer.write_all(recovery)?;
            }

            remaining -= n as u64;
        }

        for writer in parity_writers.iter_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Reconstruct missing slices.
    ///
    /// `sources` holds one entry per slice position (`data` data slices
    /// followed by `parity` parity slices); `None` marks a missing slice.
    /// `sinks` must hold a writer at exactly the missing positions that the
    /// caller wants rebuilt. Every present source must deliver `slice_size`
    /// bytes.
    pub fn reconstruct(
        &self,
        sources: &mut [Option<Box<dyn Read + Send>>],
        sinks: &mut [Option<Box<dyn Write + Send>>],
        slice_size: u64,
    ) -> Result<()> {
        let total = self.total_slices();
        if sources.len() != total || sinks.len() != total {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {total} source and sink slots"
            )));
        }

        let have = sources.iter().filter(|s| s.is_some()).count();
        if have < self.data {
            return Err(ErasureError::InsufficientSlices {
                have,
                need: self.data,
            });
        }

        let wants_parity = sinks
            .iter()
            .enumerate()
            .any(|(i, s)| i >= self.data && s.is_some());
        if sinks.iter().all(Option::is_none) {
            return Ok(());
        }

        let mut bufs: Vec<Option<Vec<u8>>> = sources
            .iter()
            .map(|s| s.as_ref().map(|_| vec![0u8; CHUNK_SIZE]))
            .collect();
        let mut remaining = slice_size;

        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE as u64) as usize;

            for (source, buf) in sources.iter_mut().zip(bufs.iter_mut()) {
                if let (Some(reader), Some(buf)) = (source.as_mut(), buf.as_mut()) {
                    reader.read_exact(&mut buf[..n])?;
                }
            }

            // Restore missing data slices from whatever mix survives.
            let mut restored: Vec<Option<Vec<u8>>> = vec![None; self.data];
            let data_missing = bufs[..self.data].iter().any(Option::is_none);
            if data_missing {
                let mut decoder = ReedSolomonDecoder::new(self.data, self.parity, n)
                    .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
                for (i, buf) in bufs.iter().enumerate().take(self.data) {
                    if let Some(buf) = buf {
                        decoder
                            .add_original_shard(i, &buf[..n])
                            .map_err(|e| ErasureError::ReconstructFailed(e.to_string()))?;
                    }
                }
                for (i, buf) in bufs.iter().enumerate().skip(self.data) {
                    if let Some(buf) = buf {
                        decoder
                            .add_recovery_shard(i - self.data, &buf[..n])
                            .map_err(|e| ErasureError::ReconstructFailed(e.to_string()))?;
                    }
                }
                let result = decoder
                    .decode()
                    .map_err(|e| ErasureError::ReconstructFailed(e.to_string()))?;
                for (i, slot) in restored.iter_mut().enumerate() {
                    if bufs[i].is_none() {
                        let shard = result.restored_original(i).ok_or_else(|| {
                            ErasureError::ReconstructFailed(format!(
                                "data slice {i} not restored"
                            ))
                        })?;
                        *slot = Some(shard.to_vec());
                    }
                }
            }

            for i in 0..self.data {
                if let Some(writer) = sinks[i].as_mut() {
                    let chunk = match (&bufs[i], &restored[i]) {
                        (Some(buf), _) => &buf[..n],
                        (None, Some(r)) => &r[..n],
                        (None, None) => {
                            return Err(ErasureError::ReconstructFailed(format!(
                                "no bytes for data slice {i}"
                            )));
                        }
                    };
                    writer.write_all(chunk)?;
                }
            }

            // Missing parity regenerates by re-encoding the full data row.
            if wants_parity {
                let mut encoder = ReedSolomonEncoder::new(self.data, self.parity, n)
                    .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
                for i in 0..self.data {
                    let chunk = match (&bufs[i], &restored[i]) {
                        (Some(buf), _) => &buf[..n],
                        (None, Some(r)) => &r[..n],
                        (None, None) => {
                            return Err(ErasureError::ReconstructFailed(format!(
                                "no bytes for data slice {i}"
                            )));
                        }
                    };
                    encoder
                        .add_original_shard(chunk)
                        .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
                }
                let result = encoder
                    .encode()
                    .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
                for (j, recovery) in result.recovery_iter().enumerate() {
                    if let Some(writer) = sinks[self.data + j].as_mut() {
                        writer.write_all(recovery)?;
                    }
                }
            }

            remaining -= n as u64;
        }

        for sink in sinks.iter_mut().flatten() {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn section(obj: &[u8], idx: usize, slice_size: u64) -> Box<dyn Read + Send> {
        let start = (idx as u64 * slice_size) as usize;
        let mut buf = vec![0u8; slice_size as usize];
        if start < obj.len() {
            let end = obj.len().min(start + slice_size as usize);
            buf[..end - start].copy_from_slice(&obj[start..end]);
        }
        Box::new(Cursor::new(buf))
    }

    fn encode_obj(obj: &[u8], data: usize, parity: usize) -> (Vec<Vec<u8>>, u64) {
        let codec = StreamCodec::new(data, parity).unwrap();
        let slice_size = slice_size_for(obj.len() as u64, data);

        let mut readers: Vec<Box<dyn Read + Send>> =
            (0..data).map(|i| section(obj, i, slice_size)).collect();
        let outs: Vec<SharedVec> = (0..parity).map(|_| SharedVec::default()).collect();
        let mut writers: Vec<Box<dyn Write + Send>> = outs
            .iter()
            .map(|o| Box::new(o.clone()) as Box<dyn Write + Send>)
            .collect();
        codec.encode(&mut readers, &mut writers, slice_size).unwrap();

        let mut slices: Vec<Vec<u8>> = (0..data)
            .map(|i| {
                let mut v = vec![0u8; slice_size as usize];
                section(obj, i, slice_size).read_exact(&mut v).unwrap();
                v
            })
            .collect();
        for out in outs {
            slices.push(out.take());
        }
        (slices, slice_size)
    }

    /// Vec<u8> writer that can be observed after the codec consumed the box.
    #[derive(Clone, Default)]
    struct SharedVec(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl SharedVec {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    impl Write for SharedVec {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_slice_size_alignment() {
        assert_eq!(slice_size_for(0, 4), 64);
        assert_eq!(slice_size_for(1, 4), 64);
        assert_eq!(slice_size_for(256, 4), 64);
        assert_eq!(slice_size_for(257, 4), 128);
        assert_eq!(slice_size_for(16 * 1024 * 1024, 4), 4 * 1024 * 1024);
    }

    #[test]
    fn test_roundtrip_drop_parity_many() {
        let obj: Vec<u8> = (0..100_000u32).map(|i| (i * 7 + 3) as u8).collect();
        let (slices, slice_size) = encode_obj(&obj, 4, 2);
        assert_eq!(slices.len(), 6);

        let codec = StreamCodec::new(4, 2).unwrap();

        // Drop every 2-combination of slices and rebuild them.
        for a in 0..6 {
            for b in (a + 1)..6 {
                let mut sources: Vec<Option<Box<dyn Read + Send>>> = slices
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        if i == a || i == b {
                            None
                        } else {
                            Some(Box::new(Cursor::new(s.clone())) as Box<dyn Read + Send>)
                        }
                    })
                    .collect();
                let outs: Vec<SharedVec> = vec![SharedVec::default(), SharedVec::default()];
                let mut sinks: Vec<Option<Box<dyn Write + Send>>> = (0..6)
                    .map(|i| {
                        if i == a {
                            Some(Box::new(outs[0].clone()) as Box<dyn Write + Send>)
                        } else if i == b {
                            Some(Box::new(outs[1].clone()) as Box<dyn Write + Send>)
                        } else {
                            None
                        }
                    })
                    .collect();

                codec
                    .reconstruct(&mut sources, &mut sinks, slice_size)
                    .unwrap();

                assert_eq!(outs[0].take(), slices[a], "slice {a} (dropped with {b})");
                assert_eq!(outs[1].take(), slices[b], "slice {b} (dropped with {a})");
            }
        }
    }

    #[test]
    fn test_insufficient_slices() {
        let obj = vec![42u8; 4096];
        let (slices, slice_size) = encode_obj(&obj, 4, 2);
        let codec = StreamCodec::new(4, 2).unwrap();

        // Only 3 of 6 left: below data count.
        let mut sources: Vec<Option<Box<dyn Read + Send>>> = slices
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (i < 3).then(|| Box::new(Cursor::new(s.clone())) as Box<dyn Read + Send>)
            })
            .collect();
        let mut sinks: Vec<Option<Box<dyn Write + Send>>> = (0..6)
            .map(|i| {
                (i >= 3).then(|| {
                    Box::new(Cursor::new(Vec::new())) as Box<dyn Write + Send>
                })
            })
            .collect();

        let err = codec
            .reconstruct(&mut sources, &mut sinks, slice_size)
            .unwrap_err();
        assert!(matches!(
            err,
            ErasureError::InsufficientSlices { have: 3, need: 4 }
        ));
    }

    #[test]
    fn test_multi_chunk_object() {
        // Larger than CHUNK_SIZE per slice to exercise the chunk loop.
        let obj: Vec<u8> = (0..(CHUNK_SIZE * 3 + 1234))
            .map(|i| (i % 251) as u8)
            .collect();
        let (slices, slice_size) = encode_obj(&obj, 2, 2);
        assert!(slice_size > CHUNK_SIZE as u64);

        let codec = StreamCodec::new(2, 2).unwrap();
        let mut sources: Vec<Option<Box<dyn Read + Send>>> = vec![
            None,
            Some(Box::new(Cursor::new(slices[1].clone()))),
            None,
            Some(Box::new(Cursor::new(slices[3].clone()))),
        ];
        let out = SharedVec::default();
        let mut sinks: Vec<Option<Box<dyn Write + Send>>> = vec![
            Some(Box::new(out.clone())),
            None,
            None,
            None,
        ];
        codec
            .reconstruct(&mut sources, &mut sinks, slice_size)
            .unwrap();
        assert_eq!(out.take(), slices[0]);
    }
}
