//! S3 multipart calls, each signed by the API right before it is sent.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use klb_upload_protocol::constants::{AMZ_CONTENT_SHA256_HEADER, AMZ_DATE_HEADER, EMPTY_SHA256};
use klb_upload_transfer::{ChunkFailure, RetryPolicy, checksum_bytes};

use crate::error::{ApiError, UploadError};
use crate::signing::SigningClient;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportError};

/// Characters left as-is in a URI component: the RFC 3986 unreserved set.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Object keys keep their `/` separators.
const KEY_ENCODE_SET: &AsciiSet = &URI_ENCODE_SET.remove(b'/');

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Location of the object being uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Object {
    pub host: String,
    pub bucket: String,
    pub key: String,
    pub region: String,
}

impl S3Object {
    /// Path-style object path, URI-encoded.
    pub fn path(&self) -> String {
        format!(
            "/{}/{}",
            utf8_percent_encode(&self.bucket, URI_ENCODE_SET),
            utf8_percent_encode(self.key.trim_start_matches('/'), KEY_ENCODE_SET)
        )
    }

    pub fn initiate_uri(&self) -> String {
        format!("{}?uploads", self.path())
    }

    pub fn part_uri(&self, part_number: u32, upload_id: &str) -> String {
        format!(
            "{}?partNumber={part_number}&uploadId={}",
            self.path(),
            utf8_percent_encode(upload_id, URI_ENCODE_SET)
        )
    }

    /// URI of the complete (POST) and abort (DELETE) calls.
    pub fn upload_uri(&self, upload_id: &str) -> String {
        format!(
            "{}?uploadId={}",
            self.path(),
            utf8_percent_encode(upload_id, URI_ENCODE_SET)
        )
    }

    fn url(&self, uri: &str) -> String {
        format!("https://{}{uri}", self.host)
    }
}

/// Failure of one S3 call.
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    #[error("signing failed: {0}")]
    Signing(ApiError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
        body: String,
    },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl S3Error {
    pub fn is_cancelled(&self) -> bool {
        match self {
            S3Error::Signing(e) => e.is_cancelled(),
            S3Error::Transport(e) => *e == TransportError::Cancelled,
            _ => false,
        }
    }

    /// Transport failures, 5xx and S3's throttling codes.
    pub fn is_retryable(&self) -> bool {
        match self {
            S3Error::Transport(e) => e.is_retryable(),
            S3Error::Status { status, code, .. } => {
                *status >= 500 || matches!(code.as_deref(), Some("InternalError" | "SlowDown"))
            }
            _ => false,
        }
    }

    /// Classifies a failed part upload for the transfer engine.
    pub fn into_chunk_failure(self) -> ChunkFailure {
        if self.is_cancelled() {
            return ChunkFailure::Cancelled;
        }
        if self.is_retryable() {
            return ChunkFailure::Retryable(self.to_string());
        }
        match self {
            S3Error::Signing(e) => ChunkFailure::Signing(e.to_string()),
            S3Error::Status { status, body, .. } => ChunkFailure::Rejected { status, body },
            S3Error::Transport(e) => ChunkFailure::Invalid(e.to_string()),
            other => ChunkFailure::Rejected {
                status: 200,
                body: other.to_string(),
            },
        }
    }

    /// Maps a failed control call (initiate, complete, abort).
    pub fn into_upload_error(self, operation: &'static str) -> UploadError {
        if self.is_cancelled() {
            return UploadError::Cancelled;
        }
        match self {
            S3Error::Signing(e) => UploadError::Signing(e.to_string()),
            S3Error::Status {
                status, message, ..
            } => UploadError::Storage {
                operation,
                status: Some(status),
                message,
            },
            other => UploadError::Storage {
                operation,
                status: None,
                message: other.to_string(),
            },
        }
    }
}

/// Signed S3 multipart client for one object.
#[derive(Clone)]
pub struct S3Client {
    transport: Arc<dyn Transport>,
    signer: SigningClient,
    object: S3Object,
    retry: RetryPolicy,
}

impl S3Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: SigningClient,
        object: S3Object,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            signer,
            object,
            retry,
        }
    }

    pub fn object(&self) -> &S3Object {
        &self.object
    }

    /// `POST ?uploads`; returns the `UploadId`.
    pub async fn initiate(
        &self,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<String, S3Error> {
        let uri = self.object.initiate_uri();
        let uri = uri.as_str();
        let headers: &[(&str, &str)] = &[("content-type", content_type)];
        let response = self
            .with_retry("initiate", cancel, move || {
                self.send_signed(HttpMethod::Post, uri, Bytes::new(), headers, cancel)
            })
            .await?;
        let fields = parse_xml(&response.body).map_err(S3Error::Malformed)?;
        let upload_id = fields
            .get("UploadId")
            .filter(|id| !id.is_empty())
            .cloned()
            .ok_or_else(|| S3Error::Malformed("no UploadId in InitiateMultipartUpload response".into()))?;
        debug!(key = %self.object.key, upload_id = %upload_id, "multipart upload initiated");
        Ok(upload_id)
    }

    /// `PUT ?partNumber=N&uploadId=U`; returns the part's `ETag`.
    ///
    /// Not retried here; the transfer engine owns part retries.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, S3Error> {
        let uri = self.object.part_uri(part_number, upload_id);
        let response = self
            .send_signed(HttpMethod::Put, &uri, body, &[], cancel)
            .await?;
        response
            .header("etag")
            .filter(|etag| !etag.is_empty())
            .map(String::from)
            .ok_or_else(|| S3Error::Malformed(format!("no ETag for part {part_number}")))
    }

    /// `POST ?uploadId=U` with the part list.
    ///
    /// S3 may answer 200 with an `<Error>` document; that is a failure too.
    pub async fn complete(
        &self,
        upload_id: &str,
        parts: &[(u32, String)],
        cancel: &CancellationToken,
    ) -> Result<(), S3Error> {
        let uri = self.object.upload_uri(upload_id);
        let uri = uri.as_str();
        let body = Bytes::from(complete_body(parts).map_err(S3Error::Malformed)?);
        let body = &body;
        self.with_retry("complete", cancel, move || async move {
            let response = self
                .send_signed(
                    HttpMethod::Post,
                    uri,
                    body.clone(),
                    &[("content-type", "application/xml")],
                    cancel,
                )
                .await?;
            if let Some(err) = embedded_error(&response) {
                return Err(err);
            }
            Ok(())
        })
        .await?;
        debug!(key = %self.object.key, parts = parts.len(), "multipart upload completed");
        Ok(())
    }

    /// `DELETE ?uploadId=U`, discarding uploaded parts.
    pub async fn abort(&self, upload_id: &str, cancel: &CancellationToken) -> Result<(), S3Error> {
        let uri = self.object.upload_uri(upload_id);
        self.send_signed(HttpMethod::Delete, &uri, Bytes::new(), &[], cancel)
            .await?;
        debug!(key = %self.object.key, upload_id = %upload_id, "multipart upload aborted");
        Ok(())
    }

    async fn send_signed(
        &self,
        method: HttpMethod,
        uri: &str,
        body: Bytes,
        extra_headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, S3Error> {
        let body_hash = if body.is_empty() {
            EMPTY_SHA256.to_string()
        } else {
            checksum_bytes(&body)
        };
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut signed = BTreeMap::new();
        signed.insert("host".to_string(), self.object.host.clone());
        signed.insert(AMZ_DATE_HEADER.to_string(), amz_date);
        signed.insert(AMZ_CONTENT_SHA256_HEADER.to_string(), body_hash.clone());
        for (name, value) in extra_headers {
            signed.insert(name.to_ascii_lowercase(), value.to_string());
        }

        let authorization = self
            .signer
            .sign(method, &self.object.host, uri, &signed, &body_hash, cancel)
            .await
            .map_err(S3Error::Signing)?;

        let mut request = HttpRequest::new(method, self.object.url(uri));
        for (name, value) in signed.into_iter().filter(|(name, _)| name != "host") {
            request = request.header(name, value);
        }
        let request = request.header("Authorization", authorization).body(body);

        let response = self.transport.execute(request, cancel).await?;
        if !response.is_success() {
            return Err(status_error(&response));
        }
        Ok(response)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, S3Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, S3Error>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_retry(attempt);
                    warn!(operation, attempt, ?delay, error = %e, "S3 call failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled.into()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

fn status_error(response: &HttpResponse) -> S3Error {
    let body = response.text();
    let fields = parse_xml(&response.body).unwrap_or_default();
    let code = fields.get("Code").cloned();
    let message = match (&code, fields.get("Message")) {
        (Some(code), Some(msg)) => format!("{code}: {msg}"),
        (Some(code), None) => code.clone(),
        _ if body.is_empty() => "empty response".into(),
        _ => body.chars().take(200).collect(),
    };
    S3Error::Status {
        status: response.status,
        code,
        message,
        body,
    }
}

fn embedded_error(response: &HttpResponse) -> Option<S3Error> {
    let fields = parse_xml(&response.body).ok()?;
    if fields.get("#root").map(String::as_str) != Some("Error") {
        return None;
    }
    Some(status_error(response))
}

/// Flattens an XML document into the text of its leaf elements, keyed by
/// local name (first occurrence wins). The root element name is stored
/// under `#root`.
fn parse_xml(xml: &[u8]) -> Result<HashMap<String, String>, String> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| e.to_string())? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                fields.entry("#root".to_string()).or_insert_with(|| name.clone());
                current = Some(name);
            }
            Event::Text(t) => {
                if let Some(name) = current.take() {
                    let text = t.unescape().map_err(|e| e.to_string())?;
                    fields.entry(name).or_insert_with(|| text.into_owned());
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(fields)
}

/// `CompleteMultipartUpload` document for `(part_number, etag)` pairs.
fn complete_body(parts: &[(u32, String)]) -> Result<Vec<u8>, String> {
    let mut writer = Writer::new(Vec::new());
    let root = BytesStart::new("CompleteMultipartUpload").with_attributes([("xmlns", S3_XMLNS)]);
    writer
        .write_event(Event::Start(root))
        .map_err(|e| e.to_string())?;
    for (number, etag) in parts {
        writer
            .write_event(Event::Start(BytesStart::new("Part")))
            .map_err(|e| e.to_string())?;
        write_text_element(&mut writer, "PartNumber", &number.to_string())?;
        write_text_element(&mut writer, "ETag", etag)?;
        writer
            .write_event(Event::End(BytesEnd::new("Part")))
            .map_err(|e| e.to_string())?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("CompleteMultipartUpload")))
        .map_err(|e| e.to_string())?;
    Ok(writer.into_inner())
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), String> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(|e| e.to_string())?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|e| e.to_string())?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::testing::ScriptedTransport;

    fn object() -> S3Object {
        S3Object {
            host: "s3.us-west-2.amazonaws.com".into(),
            bucket: "bkt".into(),
            key: "upload/my file.bin".into(),
            region: "us-west-2".into(),
        }
    }

    fn client(transport: Arc<ScriptedTransport>, retry: RetryPolicy) -> S3Client {
        let api = ApiClient::new(transport.clone(), "https://api.example/_rest", None);
        S3Client::new(transport, SigningClient::new(api, "clabu-1"), object(), retry)
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            jitter: false,
            ..Default::default()
        }
    }

    fn is_sign(req: &HttpRequest) -> bool {
        req.url.ends_with(":signV4")
    }

    fn sign_ok() -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(
            200,
            r#"{"result":"success","data":{"authorization":"AWS4-HMAC-SHA256 sig"}}"#,
        ))
    }

    #[test]
    fn uris_are_encoded() {
        let o = object();
        assert_eq!(o.path(), "/bkt/upload/my%20file.bin");
        assert_eq!(o.initiate_uri(), "/bkt/upload/my%20file.bin?uploads");
        assert_eq!(
            o.part_uri(3, "a+b/c"),
            "/bkt/upload/my%20file.bin?partNumber=3&uploadId=a%2Bb%2Fc"
        );
        assert_eq!(o.upload_uri("u1"), "/bkt/upload/my%20file.bin?uploadId=u1");
    }

    #[test]
    fn complete_body_lists_parts_in_order() {
        let body = complete_body(&[(1, "\"e1\"".into()), (2, "\"e2\"".into())]).unwrap();
        let xml = String::from_utf8(body).unwrap();
        assert!(xml.starts_with("<CompleteMultipartUpload xmlns="));
        let p1 = xml.find("<PartNumber>1</PartNumber>").unwrap();
        let p2 = xml.find("<PartNumber>2</PartNumber>").unwrap();
        assert!(p1 < p2);
        assert!(xml.contains("<ETag>&quot;e1&quot;</ETag>"));
    }

    #[test]
    fn parse_initiate_response() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>bkt</Bucket>
  <Key>upload/my file.bin</Key>
  <UploadId>VXBsb2FkIElE&amp;x</UploadId>
</InitiateMultipartUploadResult>"#;
        let fields = parse_xml(xml).unwrap();
        assert_eq!(fields["#root"], "InitiateMultipartUploadResult");
        assert_eq!(fields["UploadId"], "VXBsb2FkIElE&x");
    }

    #[test]
    fn status_error_reads_s3_error_document() {
        let resp = HttpResponse::new(
            403,
            "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
        );
        match status_error(&resp) {
            S3Error::Status { status, code, message, .. } => {
                assert_eq!(status, 403);
                assert_eq!(code.as_deref(), Some("AccessDenied"));
                assert_eq!(message, "AccessDenied: Access Denied");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failure_classification() {
        let server = S3Error::Status {
            status: 503,
            code: Some("SlowDown".into()),
            message: String::new(),
            body: String::new(),
        };
        assert!(matches!(server.into_chunk_failure(), ChunkFailure::Retryable(_)));

        let client_err = S3Error::Status {
            status: 403,
            code: None,
            message: String::new(),
            body: "denied".into(),
        };
        assert_eq!(
            client_err.into_chunk_failure(),
            ChunkFailure::Rejected {
                status: 403,
                body: "denied".into()
            }
        );

        let signing = S3Error::Signing(ApiError::Http {
            status: 403,
            body: String::new(),
        });
        assert!(matches!(signing.into_chunk_failure(), ChunkFailure::Signing(_)));

        let cancelled = S3Error::Signing(ApiError::Transport(TransportError::Cancelled));
        assert_eq!(cancelled.into_chunk_failure(), ChunkFailure::Cancelled);

        let malformed = S3Error::Transport(TransportError::InvalidRequest("bad url".into()));
        assert!(matches!(malformed.into_chunk_failure(), ChunkFailure::Invalid(_)));

        let timeout = S3Error::Transport(TransportError::Timeout);
        assert!(matches!(
            timeout.into_upload_error("initiate"),
            UploadError::Storage { operation: "initiate", status: None, .. }
        ));
    }

    #[tokio::test]
    async fn upload_part_is_signed_and_returns_etag() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(|req| {
            if is_sign(req) {
                sign_ok()
            } else {
                Ok(HttpResponse::new(200, "").with_header("ETag", "\"etag-1\""))
            }
        });
        let s3 = client(transport.clone(), no_jitter(3));

        let etag = s3
            .upload_part("u1", 1, Bytes::from_static(b"part data"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(etag, "\"etag-1\"");

        let reqs = transport.requests();
        assert_eq!(reqs.len(), 2);
        let sign_body: serde_json::Value = serde_json::from_slice(&reqs[0].body).unwrap();
        assert_eq!(sign_body["method"], "PUT");
        assert_eq!(sign_body["uri"], "/bkt/upload/my%20file.bin?partNumber=1&uploadId=u1");
        assert_eq!(sign_body["hash"], checksum_bytes(b"part data"));
        assert_eq!(sign_body["headers"]["host"], "s3.us-west-2.amazonaws.com");

        let put = &reqs[1];
        assert_eq!(put.method, HttpMethod::Put);
        assert_eq!(
            put.url,
            "https://s3.us-west-2.amazonaws.com/bkt/upload/my%20file.bin?partNumber=1&uploadId=u1"
        );
        assert_eq!(put.header_value("authorization"), Some("AWS4-HMAC-SHA256 sig"));
        assert_eq!(
            put.header_value(AMZ_CONTENT_SHA256_HEADER),
            Some(checksum_bytes(b"part data").as_str())
        );
        assert!(put.header_value(AMZ_DATE_HEADER).is_some_and(|d| d.len() == 16));
    }

    #[tokio::test]
    async fn missing_etag_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(|req| {
            if is_sign(req) {
                sign_ok()
            } else {
                Ok(HttpResponse::new(200, ""))
            }
        });
        let err = client(transport, no_jitter(3))
            .upload_part("u1", 2, Bytes::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::Malformed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_retries_embedded_internal_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        transport.route(move |req| {
            if is_sign(req) {
                return sign_ok();
            }
            let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Ok(HttpResponse::new(
                    200,
                    "<Error><Code>InternalError</Code><Message>try again</Message></Error>",
                ))
            } else {
                Ok(HttpResponse::new(
                    200,
                    "<CompleteMultipartUploadResult><ETag>\"x-2\"</ETag></CompleteMultipartUploadResult>",
                ))
            }
        });
        let s3 = client(transport.clone(), no_jitter(3));

        s3.complete("u1", &[(1, "\"a\"".into())], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        // Every attempt is signed again.
        assert_eq!(transport.requests_matching(is_sign).len(), 2);
    }

    #[tokio::test]
    async fn initiate_parses_upload_id() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(|req| {
            if is_sign(req) {
                sign_ok()
            } else {
                Ok(HttpResponse::new(
                    200,
                    "<InitiateMultipartUploadResult><UploadId>up-42</UploadId></InitiateMultipartUploadResult>",
                ))
            }
        });
        let s3 = client(transport.clone(), no_jitter(3));
        let id = s3.initiate("video/mp4", &CancellationToken::new()).await.unwrap();
        assert_eq!(id, "up-42");

        let post = transport.requests_matching(|r| !is_sign(r)).remove(0);
        assert_eq!(post.method, HttpMethod::Post);
        assert!(post.url.ends_with("?uploads"));
        assert_eq!(post.header_value("content-type"), Some("video/mp4"));
    }

    #[tokio::test]
    async fn abort_sends_delete() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(|req| {
            if is_sign(req) {
                sign_ok()
            } else {
                Ok(HttpResponse::new(204, ""))
            }
        });
        client(transport.clone(), no_jitter(3))
            .abort("u1", &CancellationToken::new())
            .await
            .unwrap();
        let delete = transport.requests_matching(|r| !is_sign(r)).remove(0);
        assert_eq!(delete.method, HttpMethod::Delete);
        assert!(delete.url.ends_with("?uploadId=u1"));
    }
}
