//! Data types for upload sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

use klb_upload_protocol::CompletionResult;
use klb_upload_transfer::TransferProgress;

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, `start` not yet called.
    Pending,
    Negotiating,
    Transferring,
    Completing,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Succeeded | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether `cancel` still has an effect.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending | SessionStatus::Negotiating | SessionStatus::Transferring
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Negotiating)
            | (Negotiating, Transferring)
            | (Transferring, Completing)
            | (Completing, Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            (from, Cancelled) => from.is_cancellable(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Negotiating => "negotiating",
            SessionStatus::Transferring => "transferring",
            SessionStatus::Completing => "completing",
            SessionStatus::Succeeded => "succeeded",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Everything needed to re-issue the completion call of a transferred upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTarget {
    /// `Complete` endpoint (direct PUT) or `{id}:handleComplete` (S3).
    pub endpoint: String,
    pub expected_size: u64,
    /// Used when the server omits `Mime`.
    pub mime_type: String,
    /// Local digest, set when hashes are verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
}

/// Event emitted by an upload session.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    Progress {
        session_id: String,
        progress: TransferProgress,
    },
    Completed {
        session_id: String,
        result: CompletionResult,
    },
    Failed {
        session_id: String,
        error: String,
    },
}
