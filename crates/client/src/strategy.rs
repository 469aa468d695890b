//! Per-method chunk uploaders driven by the transfer engine.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use klb_upload_transfer::{BoxFuture, ChunkDescriptor, ChunkFailure, ChunkReceipt, ChunkUploader, Framing};

use crate::s3::S3Client;
use crate::transport::{HttpMethod, HttpRequest, Transport, TransportError};

/// Direct PUT to a server-provided URL.
///
/// Only `200 OK` is accepted. 5xx and transport failures are retryable;
/// anything else is a rejection.
pub struct DirectPutUploader {
    transport: Arc<dyn Transport>,
    put_url: String,
    mime_type: String,
    framing: Framing,
}

impl DirectPutUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        put_url: impl Into<String>,
        mime_type: impl Into<String>,
        framing: Framing,
    ) -> Self {
        Self {
            transport,
            put_url: put_url.into(),
            mime_type: mime_type.into(),
            framing,
        }
    }

    fn build_request(&self, chunk: &ChunkDescriptor, body: Bytes) -> HttpRequest {
        let mut request = HttpRequest::new(HttpMethod::Put, &self.put_url)
            .header("Content-Type", &self.mime_type);
        if self.framing == Framing::ContentRange
            && let Some(range) = chunk.content_range()
        {
            request = request.header("Content-Range", range);
        }
        request.body(body)
    }
}

impl ChunkUploader for DirectPutUploader {
    fn upload_chunk<'a>(
        &'a self,
        chunk: &'a ChunkDescriptor,
        body: Bytes,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChunkReceipt, ChunkFailure>> {
        Box::pin(async move {
            let request = self.build_request(chunk, body);
            let response = self
                .transport
                .execute(request, cancel)
                .await
                .map_err(transport_failure)?;
            match response.status {
                200 => Ok(ChunkReceipt::default()),
                status if status >= 500 => Err(ChunkFailure::Retryable(format!("HTTP {status}"))),
                status => Err(ChunkFailure::Rejected {
                    status,
                    body: response.text(),
                }),
            }
        })
    }
}

/// S3 part PUT, keeping the part's `ETag` as its receipt.
pub struct S3PartUploader<'s> {
    s3: &'s S3Client,
    upload_id: &'s str,
}

impl<'s> S3PartUploader<'s> {
    pub fn new(s3: &'s S3Client, upload_id: &'s str) -> Self {
        Self { s3, upload_id }
    }
}

impl ChunkUploader for S3PartUploader<'_> {
    fn upload_chunk<'a>(
        &'a self,
        chunk: &'a ChunkDescriptor,
        body: Bytes,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ChunkReceipt, ChunkFailure>> {
        Box::pin(async move {
            self.s3
                .upload_part(self.upload_id, chunk.part_number(), body, cancel)
                .await
                .map(ChunkReceipt::etag)
                .map_err(|e| e.into_chunk_failure())
        })
    }
}

fn transport_failure(e: TransportError) -> ChunkFailure {
    match e {
        TransportError::Cancelled => ChunkFailure::Cancelled,
        TransportError::InvalidRequest(message) => ChunkFailure::Invalid(message),
        other => ChunkFailure::Retryable(other.to_string()),
    }
}
