use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use klb_upload_protocol::constants::DEFAULT_MAX_CONCURRENCY;

use crate::plan::{ChunkDescriptor, ChunkPlan};
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;
use crate::source::UploadSource;
use crate::types::{ChunkReceipt, ChunkTable};
use crate::{BoxFuture, TransferError};

/// Outcome of one failed chunk attempt, as classified by the strategy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkFailure {
    /// Transport failure or 5xx; the same range may be sent again.
    #[error("{0}")]
    Retryable(String),

    /// 4xx or unexpected status; retrying will not help.
    #[error("rejected with HTTP {status}")]
    Rejected { status: u16, body: String },

    /// The signing call failed; the session is unusable.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The request could not be built; sending it again gives the same result.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("cancelled")]
    Cancelled,
}

/// Sends one chunk over the wire.
///
/// Implemented once per upload method. Implementations must observe
/// `cancel` in every network call they make.
pub trait ChunkUploader: Send + Sync {
    fn upload_chunk<'a>(
        &'a self,
        chunk: &'a ChunkDescriptor,
        body: Bytes,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChunkReceipt, ChunkFailure>>;
}

enum AttemptError {
    Chunk(ChunkFailure),
    Source(TransferError),
}

impl AttemptError {
    fn message(&self) -> String {
        match self {
            AttemptError::Chunk(f) => f.to_string(),
            AttemptError::Source(e) => e.to_string(),
        }
    }

    fn into_transfer_error(self, index: usize, attempts: u32) -> TransferError {
        match self {
            AttemptError::Source(e) => e,
            AttemptError::Chunk(ChunkFailure::Retryable(message)) => TransferError::ChunkExhausted {
                index,
                attempts,
                message,
            },
            AttemptError::Chunk(ChunkFailure::Rejected { status, body }) => {
                TransferError::ChunkRejected {
                    index,
                    status,
                    body,
                }
            }
            AttemptError::Chunk(ChunkFailure::Signing(message)) => {
                TransferError::Signing { index, message }
            }
            AttemptError::Chunk(ChunkFailure::Invalid(message)) => TransferError::ChunkInvalid {
                index,
                attempts,
                message,
            },
            AttemptError::Chunk(ChunkFailure::Cancelled) => TransferError::Cancelled,
        }
    }
}

type AttemptOutcome = (usize, u32, Result<ChunkReceipt, AttemptError>);

/// Runs a [`ChunkPlan`] with bounded concurrency and per-chunk retry.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    max_concurrency: usize,
    retry: RetryPolicy,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY, RetryPolicy::default())
    }
}

impl TransferEngine {
    /// A ceiling of 0 is treated as 1.
    pub fn new(max_concurrency: usize, retry: RetryPolicy) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            retry,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Transfers every chunk of `plan`, returning once all have completed.
    ///
    /// `table` and `progress` are reset for the plan and updated as chunks
    /// move through their states. On the first non-retryable failure no new
    /// chunk is dispatched, in-flight chunks are signalled and drained, and
    /// that failure is returned. Cancelling `cancel` behaves the same way
    /// and yields [`TransferError::Cancelled`].
    pub async fn run(
        &self,
        plan: &ChunkPlan,
        source: &dyn UploadSource,
        uploader: &dyn ChunkUploader,
        table: &ChunkTable,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if source.len() != plan.total_size {
            return Err(TransferError::InvalidPlan(format!(
                "plan covers {} bytes but the source has {}",
                plan.total_size,
                source.len()
            )));
        }

        table.reset(plan);
        progress.reset(plan.total_size, plan.len());

        let stop = cancel.child_token();
        let mut queue: VecDeque<(usize, Duration)> =
            (0..plan.len()).map(|i| (i, Duration::ZERO)).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<TransferError> = None;

        loop {
            while in_flight.len() < self.max_concurrency && !stop.is_cancelled() {
                let Some((index, delay)) = queue.pop_front() else {
                    break;
                };
                in_flight.push(attempt(
                    &plan.chunks[index],
                    delay,
                    source,
                    uploader,
                    table,
                    &stop,
                ));
            }

            let Some((index, attempts, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(receipt) => {
                    table.complete(index, receipt);
                    let p = progress.chunk_completed(plan.chunks[index].size_bytes);
                    debug!(
                        chunk = index,
                        attempt = attempts,
                        completed = p.completed_chunks,
                        total = p.total_chunks,
                        "chunk completed"
                    );
                }
                Err(AttemptError::Chunk(ChunkFailure::Retryable(message)))
                    if !stop.is_cancelled() && self.retry.should_retry(attempts) =>
                {
                    let delay = self.retry.delay_for_retry(attempts);
                    warn!(chunk = index, attempt = attempts, ?delay, error = %message, "chunk failed, retrying");
                    table.fail(index, message);
                    table.requeue(index);
                    queue.push_back((index, delay));
                }
                Err(err) => {
                    // attempts == 0: cancelled before it was dispatched.
                    if attempts > 0 {
                        table.fail(index, err.message());
                    }
                    if failure.is_none() && !stop.is_cancelled() {
                        warn!(chunk = index, attempt = attempts, error = %err.message(), "chunk failed, stopping transfer");
                        failure = Some(err.into_transfer_error(index, attempts));
                        stop.cancel();
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if table.completed_count() == plan.len() {
            Ok(())
        } else {
            Err(TransferError::Cancelled)
        }
    }
}

async fn attempt(
    chunk: &ChunkDescriptor,
    delay: Duration,
    source: &dyn UploadSource,
    uploader: &dyn ChunkUploader,
    table: &ChunkTable,
    stop: &CancellationToken,
) -> AttemptOutcome {
    let index = chunk.index;
    if !delay.is_zero() {
        tokio::select! {
            _ = stop.cancelled() => return (index, 0, Err(AttemptError::Chunk(ChunkFailure::Cancelled))),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    if stop.is_cancelled() {
        return (index, 0, Err(AttemptError::Chunk(ChunkFailure::Cancelled)));
    }

    let attempts = table.begin_attempt(index);
    debug!(
        chunk = index,
        attempt = attempts,
        start = chunk.start_byte,
        end = chunk.end_byte,
        "dispatching chunk"
    );

    let body = match source.read_range(chunk.start_byte, chunk.end_byte).await {
        Ok(body) => body,
        Err(e) => return (index, attempts, Err(AttemptError::Source(e))),
    };

    let result = tokio::select! {
        biased;
        r = uploader.upload_chunk(chunk, body, stop) => r.map_err(AttemptError::Chunk),
        _ = stop.cancelled() => Err(AttemptError::Chunk(ChunkFailure::Cancelled)),
    };
    (index, attempts, result)
}
