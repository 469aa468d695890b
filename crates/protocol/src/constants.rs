/// Smallest S3 multipart part size (5 MiB). Only the final part may be smaller.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest S3 multipart part size (5 GiB).
pub const S3_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in one S3 multipart upload.
pub const S3_MAX_PARTS: u64 = 10_000;

/// Largest object S3 accepts (5 TiB).
pub const S3_MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;

/// Part size used when the total size is not known up front.
///
/// 512 MiB x 10 000 parts covers the 5 TiB object ceiling.
pub const S3_STREAMING_PART_SIZE: u64 = 512 * 1024 * 1024;

/// Default concurrent chunk transfers per session.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// REST resource hosting the S3 upload session actions.
pub const S3_UPLOAD_RESOURCE: &str = "Cloud/Aws/Bucket/Upload";

/// Action that signs one outbound S3 request.
pub const SIGN_V4_ACTION: &str = "signV4";

/// Action that finalizes an S3 upload session once the object is assembled.
pub const HANDLE_COMPLETE_ACTION: &str = "handleComplete";

/// Hex SHA-256 of the empty body.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Header names used on S3 requests. Lowercase, as signed.
pub const AMZ_DATE_HEADER: &str = "x-amz-date";
pub const AMZ_CONTENT_SHA256_HEADER: &str = "x-amz-content-sha256";

/// Builds the API path for an action on an S3 upload session,
/// e.g. `Cloud/Aws/Bucket/Upload/clabu-xyz:signV4`.
pub fn s3_session_action(upload_session_id: &str, action: &str) -> String {
    format!("{S3_UPLOAD_RESOURCE}/{upload_session_id}:{action}")
}
