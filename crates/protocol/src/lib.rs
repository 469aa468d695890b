//! Wire protocol types for the KLB upload API.
//!
//! Covers the REST result envelope, the negotiation exchange (and its two
//! upload methods), the SigV4 signing call used by S3 uploads, and the
//! completion payload.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use envelope::{ApiEnvelope, ResultKind};
pub use messages::{CompletionData, NegotiateRequest, NegotiationData, SignV4Request, SignV4Response};
pub use types::{CompletionResult, NegotiationResult, UploadMethod, UploadRequest};

/// Errors produced when interpreting API payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing field {field} in {context} response")]
    MissingField {
        context: &'static str,
        field: &'static str,
    },

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unsupported upload method (response fields: {0})")]
    UnsupportedMethod(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
