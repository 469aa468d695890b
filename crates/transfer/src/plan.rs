use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use klb_upload_protocol::constants::{S3_MAX_PARTS, S3_MIN_PART_SIZE, S3_STREAMING_PART_SIZE};

const MIB: u64 = 1024 * 1024;

/// One contiguous byte range of the source. `end_byte` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub start_byte: u64,
    pub end_byte: u64,
    pub size_bytes: u64,
}

impl ChunkDescriptor {
    pub fn new(index: usize, start_byte: u64, end_byte: u64) -> Self {
        Self {
            index,
            start_byte,
            end_byte,
            size_bytes: end_byte - start_byte,
        }
    }

    /// S3 part number (1-based).
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }

    /// `Content-Range` value for a framed direct PUT, e.g. `bytes 0-4999999/*`.
    ///
    /// Zero-length ranges have no inclusive end and return `None`.
    pub fn content_range(&self) -> Option<String> {
        if self.size_bytes == 0 {
            return None;
        }
        Some(format!("bytes {}-{}/*", self.start_byte, self.end_byte - 1))
    }
}

/// How each chunk is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Single direct PUT of the whole body.
    Whole,
    /// Direct PUTs carrying a `Content-Range` header.
    ContentRange,
    /// S3 multipart parts, numbered `index + 1`.
    S3Part,
}

/// Ordered partition of `[0, total_size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_size: u64,
    /// Nominal chunk size; every chunk but the last has exactly this size.
    pub chunk_size: u64,
    pub framing: Framing,
    pub chunks: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Size of the largest chunk. Each in-flight chunk is held in memory
    /// for the whole attempt, retries included.
    pub fn max_chunk_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size_bytes).max().unwrap_or(0)
    }
}

/// Plans a direct PUT upload.
///
/// No block size, or a file that fits in one block, gives a single unframed
/// chunk. Otherwise `ceil(size / block_size)` framed chunks, the last one
/// truncated.
///
/// An unframed chunk is read into memory whole before it is sent, so a
/// server that omits `Blocksize` costs the full file size in RAM.
pub fn plan_direct_put(size: u64, block_size: Option<NonZeroU64>) -> ChunkPlan {
    match block_size {
        Some(bs) if size > bs.get() => partition(size, bs.get(), Framing::ContentRange),
        _ => ChunkPlan {
            total_size: size,
            chunk_size: size,
            framing: Framing::Whole,
            chunks: vec![ChunkDescriptor::new(0, 0, size)],
        },
    }
}

/// Plans an S3 multipart upload with [`s3_part_size`].
pub fn plan_s3(size: u64) -> ChunkPlan {
    partition(size, s3_part_size(Some(size)), Framing::S3Part)
}

/// Part size for an S3 multipart upload of `size` bytes.
///
/// The smallest whole number of MiB that keeps the part count within
/// 10 000, never below 5 MiB. Unknown sizes use the fixed streaming part
/// size.
pub fn s3_part_size(size: Option<u64>) -> u64 {
    let Some(size) = size else {
        return S3_STREAMING_PART_SIZE;
    };
    let per_part = size.div_ceil(S3_MAX_PARTS);
    let rounded = per_part.div_ceil(MIB) * MIB;
    rounded.max(S3_MIN_PART_SIZE)
}

fn partition(size: u64, chunk_size: u64, framing: Framing) -> ChunkPlan {
    let count = size.div_ceil(chunk_size).max(1);
    let chunks = (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(size);
            ChunkDescriptor::new(i as usize, start, end)
        })
        .collect();
    ChunkPlan {
        total_size: size,
        chunk_size,
        framing,
        chunks,
    }
}
