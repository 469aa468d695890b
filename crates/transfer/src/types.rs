use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::plan::{ChunkDescriptor, ChunkPlan};

/// Lifecycle of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// What a strategy keeps from a completed chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    /// S3 `ETag` of the part, quotes included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ChunkReceipt {
    pub fn etag(etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
        }
    }
}

/// Transfer state of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    pub descriptor: ChunkDescriptor,
    pub status: ChunkStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ChunkReceipt>,
}

impl ChunkState {
    pub fn new(descriptor: ChunkDescriptor) -> Self {
        Self {
            descriptor,
            status: ChunkStatus::Pending,
            attempts: 0,
            last_error: None,
            receipt: None,
        }
    }
}

/// Chunk states of one session (thread-safe).
///
/// Only the transfer engine mutates it; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct ChunkTable {
    inner: RwLock<Vec<ChunkState>>,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all states with fresh `Pending` entries for `plan`.
    pub fn reset(&self, plan: &ChunkPlan) {
        *self.write() = plan.chunks.iter().copied().map(ChunkState::new).collect();
    }

    /// Copy of every chunk state, ordered by index.
    pub fn snapshot(&self) -> Vec<ChunkState> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Receipts of every chunk in index order, or `None` if any chunk has
    /// not completed.
    pub fn receipts(&self) -> Option<Vec<ChunkReceipt>> {
        self.read()
            .iter()
            .map(|s| match s.status {
                ChunkStatus::Completed => Some(s.receipt.clone().unwrap_or_default()),
                _ => None,
            })
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.read()
            .iter()
            .filter(|s| s.status == ChunkStatus::Completed)
            .count()
    }

    /// `Pending -> InFlight`; returns the attempt number.
    pub(crate) fn begin_attempt(&self, index: usize) -> u32 {
        let mut states = self.write();
        let state = &mut states[index];
        state.status = ChunkStatus::InFlight;
        state.attempts += 1;
        state.attempts
    }

    /// `InFlight -> Completed`.
    pub(crate) fn complete(&self, index: usize, receipt: ChunkReceipt) {
        let mut states = self.write();
        let state = &mut states[index];
        state.status = ChunkStatus::Completed;
        state.last_error = None;
        state.receipt = Some(receipt);
    }

    /// `InFlight -> Failed`.
    pub(crate) fn fail(&self, index: usize, error: String) {
        let mut states = self.write();
        let state = &mut states[index];
        state.status = ChunkStatus::Failed;
        state.last_error = Some(error);
    }

    /// `Failed -> Pending`, before a retry.
    pub(crate) fn requeue(&self, index: usize) {
        let mut states = self.write();
        if states[index].status == ChunkStatus::Failed {
            states[index].status = ChunkStatus::Pending;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ChunkState>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ChunkState>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
