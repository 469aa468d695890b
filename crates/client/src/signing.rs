//! Server-side SigV4 signing for S3 requests.
//!
//! The client never holds AWS credentials: each outbound S3 request is
//! described to the API, which returns the `Authorization` header value.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use klb_upload_protocol::constants::{SIGN_V4_ACTION, s3_session_action};
use klb_upload_protocol::{ProtocolError, SignV4Request, SignV4Response};

use crate::api::ApiClient;
use crate::error::ApiError;
use crate::transport::HttpMethod;

/// Signs S3 requests of one upload session.
#[derive(Clone)]
pub struct SigningClient {
    api: ApiClient,
    upload_session_id: String,
}

impl SigningClient {
    pub fn new(api: ApiClient, upload_session_id: impl Into<String>) -> Self {
        Self {
            api,
            upload_session_id: upload_session_id.into(),
        }
    }

    pub fn upload_session_id(&self) -> &str {
        &self.upload_session_id
    }

    /// Returns the `Authorization` value for the described request.
    ///
    /// `uri` is the path plus query string; `headers` are the signed
    /// headers with lowercase names.
    pub async fn sign(
        &self,
        method: HttpMethod,
        host: &str,
        uri: &str,
        headers: &BTreeMap<String, String>,
        body_sha256: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ApiError> {
        let request = SignV4Request {
            method: method.as_str().to_string(),
            host: host.to_string(),
            uri: uri.to_string(),
            headers: headers.clone(),
            hash: body_sha256.to_string(),
        };
        let endpoint = s3_session_action(&self.upload_session_id, SIGN_V4_ACTION);
        let response: SignV4Response = self.api.post(&endpoint, &request, cancel).await?;
        debug!(method = %method, uri = %uri, "request signed");

        response
            .authorization
            .filter(|a| !a.is_empty())
            .ok_or(ApiError::Protocol(ProtocolError::MissingField {
                context: "signV4",
                field: "authorization",
            }))
    }
}
