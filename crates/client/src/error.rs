//! Client error types.

use klb_upload_protocol::ProtocolError;
use klb_upload_transfer::TransferError;

use crate::transport::TransportError;
use crate::types::CompletionTarget;

/// Failure of one REST API call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("API error (HTTP {status}): {message}")]
    Envelope {
        status: u16,
        message: String,
        token: Option<String>,
    },

    #[error("unexpected HTTP {status} response: {body}")]
    Http { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ApiError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Transport(TransportError::Cancelled))
    }
}

/// Errors surfaced by an upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("unsupported upload method: {0}")]
    UnsupportedMethod(String),

    #[error("chunk {index} failed after {attempts} attempts: {message}")]
    ChunkTransfer {
        index: usize,
        attempts: u32,
        message: String,
    },

    #[error("chunk {index} rejected with HTTP {status}: {body}")]
    ChunkRejected {
        index: usize,
        status: u16,
        body: String,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("S3 {operation} failed: {message}")]
    Storage {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// The transfer succeeded but finalizing did not. `target` allows
    /// retrying the completion call alone.
    #[error("completion failed: {message}")]
    Completion {
        message: String,
        target: Option<Box<CompletionTarget>>,
    },

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            UploadError::Cancelled | UploadError::Transport(TransportError::Cancelled)
        )
    }

    /// Completion target carried by a [`UploadError::Completion`].
    pub fn completion_target(&self) -> Option<&CompletionTarget> {
        match self {
            UploadError::Completion { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    /// Maps a failed negotiation call.
    pub(crate) fn from_negotiation(e: ApiError) -> Self {
        match e {
            e if e.is_cancelled() => UploadError::Cancelled,
            ApiError::Protocol(ProtocolError::UnsupportedMethod(fields)) => {
                UploadError::UnsupportedMethod(fields)
            }
            other => UploadError::Negotiation(other.to_string()),
        }
    }

    /// Maps a failed completion call.
    pub(crate) fn from_completion(e: ApiError, target: &CompletionTarget) -> Self {
        if e.is_cancelled() {
            return UploadError::Cancelled;
        }
        UploadError::Completion {
            message: e.to_string(),
            target: Some(Box::new(target.clone())),
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Io(e) => UploadError::Io(e),
            TransferError::InvalidPlan(msg) => UploadError::InvalidPlan(msg),
            e @ TransferError::OutOfRange { .. } => UploadError::InvalidPlan(e.to_string()),
            TransferError::ChunkExhausted {
                index,
                attempts,
                message,
            } => UploadError::ChunkTransfer {
                index,
                attempts,
                message,
            },
            TransferError::ChunkRejected {
                index,
                status,
                body,
            } => UploadError::ChunkRejected {
                index,
                status,
                body,
            },
            TransferError::ChunkInvalid {
                index,
                attempts,
                message,
            } => UploadError::ChunkTransfer {
                index,
                attempts,
                message,
            },
            TransferError::Signing { message, .. } => UploadError::Signing(message),
            TransferError::Cancelled => UploadError::Cancelled,
        }
    }
}
