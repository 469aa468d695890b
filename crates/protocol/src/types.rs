use std::fmt;
use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File metadata supplied by the caller before any network activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub last_modified: DateTime<Utc>,
    /// Application-specific negotiation parameters, sent alongside the
    /// file metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl UploadRequest {
    /// Creates a request stamped with the current time as `last_modified`.
    pub fn new(filename: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            size,
            mime_type: mime_type.into(),
            last_modified: Utc::now(),
            params: serde_json::Map::new(),
        }
    }

    /// Sets the file modification time.
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = last_modified;
        self
    }

    /// Adds one application parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Upload method chosen by the server during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    DirectPut,
    S3Multipart,
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMethod::DirectPut => f.write_str("direct_put"),
            UploadMethod::S3Multipart => f.write_str("s3_multipart"),
        }
    }
}

/// Upload instructions returned by the negotiation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NegotiationResult {
    /// PUT the bytes to `put_url`, then POST `complete_endpoint`.
    DirectPut {
        put_url: String,
        complete_endpoint: String,
        /// Maximum bytes per PUT. `None` means one PUT for the whole file.
        block_size: Option<NonZeroU64>,
    },
    /// Upload to S3 with server-signed requests, then call `handleComplete`.
    S3Multipart {
        upload_session_id: String,
        bucket_host: String,
        bucket_name: String,
        region: String,
        object_key: String,
    },
}

impl NegotiationResult {
    pub fn method(&self) -> UploadMethod {
        match self {
            NegotiationResult::DirectPut { .. } => UploadMethod::DirectPut,
            NegotiationResult::S3Multipart { .. } => UploadMethod::S3Multipart,
        }
    }
}

/// Durable object metadata returned once an upload is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub blob_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub size_bytes: u64,
    pub mime_type: String,
    /// Remaining fields of the completion payload.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
