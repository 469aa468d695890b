use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{BoxFuture, TransferError};

/// Block size used when hashing a whole source.
const HASH_BLOCK: u64 = 8 * 1024 * 1024;

/// Random-access byte source for an upload.
///
/// Ranges may be read concurrently and in any order.
pub trait UploadSource: Send + Sync {
    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `[start, end)`.
    fn read_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, TransferError>>;
}

fn check_range(start: u64, end: u64, len: u64) -> Result<(), TransferError> {
    if start > end || end > len {
        return Err(TransferError::OutOfRange { start, end, len });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// In-memory source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl UploadSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, TransferError>> {
        Box::pin(async move {
            check_range(start, end, self.len())?;
            Ok(self.data.slice(start as usize..end as usize))
        })
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// File on disk. Every range read opens its own handle, so parallel chunks
/// never share a cursor.
///
/// Ranges are read into a single buffer; see [`ChunkPlan::max_chunk_bytes`](crate::ChunkPlan::max_chunk_bytes).
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, TransferError>> {
        Box::pin(async move {
            check_range(start, end, self.len)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }
}

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes SHA-256 of an entire source and returns the hex-encoded digest.
pub async fn sha256_hex(source: &dyn UploadSource) -> Result<String, TransferError> {
    let mut hasher = Sha256::new();
    let len = source.len();
    let mut offset = 0;
    while offset < len {
        let end = (offset + HASH_BLOCK).min(len);
        hasher.update(&source.read_range(offset, end).await?);
        offset = end;
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use klb_upload_protocol::constants::EMPTY_SHA256;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_source_reads_ranges() {
        let src = MemorySource::new(&b"hello world"[..]);
        assert_eq!(src.len(), 11);
        assert_eq!(&src.read_range(6, 11).await.unwrap()[..], b"world");
        assert!(src.read_range(0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_is_rejected() {
        let src = MemorySource::new(&b"abc"[..]);
        assert!(matches!(
            src.read_range(2, 4).await,
            Err(TransferError::OutOfRange { start: 2, end: 4, len: 3 })
        ));
        assert!(src.read_range(2, 1).await.is_err());
    }

    #[tokio::test]
    async fn file_source_reads_ranges_concurrently() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        std::fs::write(&path, &data).unwrap();

        let src = FileSource::open(&path).await.unwrap();
        assert_eq!(src.len(), 10_000);

        let (a, b) = tokio::join!(src.read_range(0, 4000), src.read_range(4000, 10_000));
        let mut joined = a.unwrap().to_vec();
        joined.extend_from_slice(&b.unwrap());
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn file_source_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = FileSource::open(dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn sha256_matches_checksum_bytes() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let src = MemorySource::new(&data[..]);
        assert_eq!(sha256_hex(&src).await.unwrap(), checksum_bytes(data));
        assert_eq!(
            checksum_bytes(data),
            "d7a8fbb307d7809469ca9abcb0082e4f8d5651e46d3cdb762d02d0bf37c9e592"
        );
    }

    #[tokio::test]
    async fn sha256_of_empty_source() {
        let src = MemorySource::new(Bytes::new());
        assert_eq!(sha256_hex(&src).await.unwrap(), EMPTY_SHA256);
    }
}
