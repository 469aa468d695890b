use klb_upload_protocol::constants::{S3_MAX_PART_SIZE, S3_MAX_PARTS, S3_MIN_PART_SIZE};

use crate::TransferError;
use crate::plan::{ChunkPlan, Framing};

/// Checks that a plan is a well-formed partition for its framing.
///
/// Rejects:
/// - Empty plans
/// - Gaps, overlaps, or out-of-order indices
/// - A partition that does not end at `total_size`
/// - Chunks larger than `chunk_size`
/// - Unframed plans with more than one chunk
/// - S3 plans over 10 000 parts, with a non-final part under 5 MiB, or
///   a part over 5 GiB
pub fn validate_plan(plan: &ChunkPlan) -> Result<(), TransferError> {
    if plan.chunks.is_empty() {
        return Err(TransferError::InvalidPlan("plan has no chunks".into()));
    }

    let mut expected_start = 0u64;
    for (i, chunk) in plan.chunks.iter().enumerate() {
        if chunk.index != i {
            return Err(TransferError::InvalidPlan(format!(
                "chunk at position {i} has index {}",
                chunk.index
            )));
        }
        if chunk.start_byte != expected_start {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {i} starts at {} instead of {expected_start}",
                chunk.start_byte
            )));
        }
        if chunk.end_byte < chunk.start_byte
            || chunk.size_bytes != chunk.end_byte - chunk.start_byte
        {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {i} has inconsistent bounds"
            )));
        }
        if chunk.size_bytes > plan.chunk_size {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {i} is {} bytes, over the {} byte chunk size",
                chunk.size_bytes, plan.chunk_size
            )));
        }
        expected_start = chunk.end_byte;
    }

    if expected_start != plan.total_size {
        return Err(TransferError::InvalidPlan(format!(
            "plan covers {expected_start} of {} bytes",
            plan.total_size
        )));
    }

    match plan.framing {
        Framing::Whole if plan.chunks.len() != 1 => Err(TransferError::InvalidPlan(
            "unframed plan must have exactly one chunk".into(),
        )),
        Framing::ContentRange if plan.chunk_size == 0 => Err(TransferError::InvalidPlan(
            "framed plan has a zero chunk size".into(),
        )),
        Framing::S3Part => validate_s3(plan),
        _ => Ok(()),
    }
}

fn validate_s3(plan: &ChunkPlan) -> Result<(), TransferError> {
    if plan.chunks.len() as u64 > S3_MAX_PARTS {
        return Err(TransferError::InvalidPlan(format!(
            "{} parts exceed the {S3_MAX_PARTS} part limit",
            plan.chunks.len()
        )));
    }
    if plan.chunk_size > S3_MAX_PART_SIZE {
        return Err(TransferError::InvalidPlan(format!(
            "part size {} exceeds the {S3_MAX_PART_SIZE} byte limit",
            plan.chunk_size
        )));
    }
    let non_final = &plan.chunks[..plan.chunks.len() - 1];
    if let Some(small) = non_final.iter().find(|c| c.size_bytes < S3_MIN_PART_SIZE) {
        return Err(TransferError::InvalidPlan(format!(
            "part {} is {} bytes, under the {S3_MIN_PART_SIZE} byte minimum",
            small.part_number(),
            small.size_bytes
        )));
    }
    Ok(())
}
