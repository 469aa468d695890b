//! KLB upload client.
//!
//! Uploads a file through the KLB upload protocol: the server is asked how
//! to receive the file, then the bytes go either straight to a PUT URL or
//! to S3 as a multipart upload whose requests the server signs.
//!
//! # Pipeline
//!
//! 1. **Negotiate**: POST the file metadata, get the upload method
//! 2. **Plan**: split the file into chunks or S3 parts
//! 3. **Transfer**: upload chunks concurrently with retry
//! 4. **Complete**: finalize the upload and get the blob metadata
//!
//! [`UploadClient`] creates [`UploadSession`]s; a host tracking several
//! uploads at once can keep them in a [`SessionRegistry`].

pub mod api;
pub mod config;
pub mod content_type;
pub mod error;
pub mod registry;
pub mod s3;
pub mod session;
pub mod signing;
pub mod strategy;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types for convenience.
pub use api::ApiClient;
pub use config::{ClientConfig, HashPolicy, RetrySettings};
pub use content_type::{DEFAULT_CONTENT_TYPE, content_type_or_default, detect_content_type};
pub use error::{ApiError, UploadError};
pub use registry::SessionRegistry;
pub use s3::{S3Client, S3Error, S3Object};
pub use session::{UploadClient, UploadSession};
pub use signing::SigningClient;
pub use strategy::{DirectPutUploader, S3PartUploader};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
pub use types::{CompletionTarget, SessionStatus, UploadEvent};

pub use klb_upload_protocol::{CompletionResult, NegotiationResult, UploadMethod, UploadRequest};
pub use klb_upload_transfer::{
    ChunkState, ChunkStatus, FileSource, MemorySource, TransferProgress, UploadSource,
};
