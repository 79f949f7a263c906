//! Frame format: one header per send, then the payload.
//!
//! ```text
//! +----------+-----------------+-------------+----------+
//! | hdr len  | header (bincode)| payload len | payload  |
//! | u32 BE   | var             | u64 BE      | var      |
//! +----------+-----------------+-------------+----------+
//! ```

use crate::TransportError;
use bytes::Bytes;
use scatterio_common::{Checksum, CompressionHint, TargetId, uname};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a serialized header; anything larger is a protocol error.
pub const MAX_HEADER_BYTES: u32 = 1024 * 1024;

/// Request-type tag carried in every header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Fetch the local metadata sidecar. Zero-length payload.
    GetMd,
    /// Ask a peer to push its slice back. Zero-length payload.
    GetSlice,
    /// Ask a peer to push its replica back. Zero-length payload.
    GetReplica,
    /// Slice bytes follow: either a scheduler dispatch or a `GetSlice` reply.
    PutSlice,
    /// Replica bytes follow: dispatch, repair, or `GetReplica` reply.
    PutReplica,
    /// Best-effort cleanup. Zero-length payload, never acknowledged.
    Del,
    /// Reply to `GetMd`; the sidecar rides in `meta`.
    MdResp,
}

impl RequestKind {
    /// Whether this kind is a reply correlated by `seq`.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self, Self::MdResp | Self::PutSlice | Self::PutReplica)
    }
}

/// One header per send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub kind: RequestKind,
    /// Originating target, used for reply routing and sink keys.
    pub sender: TargetId,
    pub bucket: String,
    /// Bucket generation id; stale-artifact guard.
    pub bucket_id: u64,
    pub name: String,
    /// Payload length in bytes (also framed explicitly on the wire).
    pub size: u64,
    /// Checksum of the payload, when the sender has one.
    pub ck: Option<Checksum>,
    /// RPC correlation id; 0 for one-way sends.
    pub seq: u64,
    /// Serialized slice metadata, or an error note on failed replies.
    pub meta: Vec<u8>,
    /// Advisory compression hint for this send.
    #[serde(default)]
    pub compression: CompressionHint,
}

impl Header {
    #[must_use]
    pub fn new(kind: RequestKind, sender: TargetId, bucket: &str, bucket_id: u64, name: &str) -> Self {
        Self {
            kind,
            sender,
            bucket: bucket.to_string(),
            bucket_id,
            name: name.to_string(),
            size: 0,
            ck: None,
            seq: 0,
            meta: Vec::new(),
            compression: CompressionHint::default(),
        }
    }

    /// `bucket/name` routing key.
    #[must_use]
    pub fn uname(&self) -> String {
        uname(&self.bucket, &self.name)
    }
}

/// Write one frame.
pub async fn write_frame<W>(
    writer: &mut W,
    header: &Header,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let hdr = bincode::serialize(header).map_err(|e| TransportError::Codec(e.to_string()))?;
    if hdr.len() as u64 > u64::from(MAX_HEADER_BYTES) {
        return Err(TransportError::FrameTooLarge(format!(
            "header is {} bytes",
            hdr.len()
        )));
    }
    writer.write_u32(hdr.len() as u32).await?;
    writer.write_all(&hdr).await?;
    writer.write_u64(payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` signals a clean peer close between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(Header, Bytes)>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let hdr_len = u32::from_be_bytes(len_buf);
    if hdr_len > MAX_HEADER_BYTES {
        return Err(TransportError::FrameTooLarge(format!(
            "header length {hdr_len}"
        )));
    }

    let mut hdr_buf = vec![0u8; hdr_len as usize];
    reader.read_exact(&mut hdr_buf).await?;
    let header: Header =
        bincode::deserialize(&hdr_buf).map_err(|e| TransportError::Codec(e.to_string()))?;

    let payload_len = reader.read_u64().await?;
    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some((header, Bytes::from(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let sender = TargetId::new();
        let mut header = Header::new(RequestKind::PutSlice, sender, "bck", 42, "obj");
        header.size = 5;
        header.seq = 9;
        header.meta = b"{\"slice_id\":3}".to_vec();

        let mut buf = Vec::new();
        write_frame(&mut buf, &header, b"hello").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (back, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(back.kind, RequestKind::PutSlice);
        assert_eq!(back.sender, sender);
        assert_eq!(back.uname(), "bck/obj");
        assert_eq!(back.seq, 9);
        assert_eq!(back.meta, header.meta);
        assert_eq!(&payload[..], b"hello");

        // Clean EOF after the frame.
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let mut buf = Vec::new();
        tokio::io::AsyncWriteExt::write_u32(&mut buf, MAX_HEADER_BYTES + 1)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
