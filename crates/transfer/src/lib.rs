//! Chunk planning and bounded-concurrency transfer with per-chunk retry.
//!
//! The engine is transport-agnostic: strategies implement [`ChunkUploader`]
//! and the engine drives them over a [`ChunkPlan`].

use std::future::Future;
use std::pin::Pin;

mod engine;
mod plan;
mod progress;
mod retry;
mod source;
mod types;
mod validation;

pub use engine::{ChunkFailure, ChunkUploader, TransferEngine};
pub use plan::{ChunkDescriptor, ChunkPlan, Framing, plan_direct_put, plan_s3, s3_part_size};
pub use progress::{ProgressCallback, ProgressTracker, SpeedCalculator, TransferProgress};
pub use retry::RetryPolicy;
pub use source::{FileSource, MemorySource, UploadSource, checksum_bytes, sha256_hex};
pub use types::{ChunkReceipt, ChunkState, ChunkStatus, ChunkTable};
pub use validation::validate_plan;

/// Boxed future returned by the object-safe traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("range {start}..{end} outside source of {len} bytes")]
    OutOfRange { start: u64, end: u64, len: u64 },

    #[error("chunk {index} failed after {attempts} attempts: {message}")]
    ChunkExhausted {
        index: usize,
        attempts: u32,
        message: String,
    },

    #[error("chunk {index} rejected with HTTP {status}")]
    ChunkRejected {
        index: usize,
        status: u16,
        body: String,
    },

    #[error("chunk {index} could not be sent: {message}")]
    ChunkInvalid {
        index: usize,
        attempts: u32,
        message: String,
    },

    #[error("signing failed for chunk {index}: {message}")]
    Signing { index: usize, message: String },

    #[error("transfer cancelled")]
    Cancelled,
}
