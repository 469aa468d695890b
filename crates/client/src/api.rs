//! REST API calls wrapped in the result envelope.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use klb_upload_protocol::{ApiEnvelope, ResultKind};

use crate::error::ApiError;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};

/// Client for the REST API hosting negotiation, signing and completion.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    api_base: String,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        api_base: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            transport,
            api_base: api_base.into(),
            access_token,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Absolute URL for `endpoint`.
    ///
    /// `http://` and `https://` endpoints are used as-is; anything else is
    /// joined to the API base.
    pub fn resolve(&self, endpoint: &str) -> String {
        if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    /// POSTs `body` as JSON to `endpoint` and decodes the envelope's `data`.
    pub async fn post<B, T>(
        &self,
        endpoint: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.resolve(endpoint);
        let mut request = HttpRequest::new(HttpMethod::Post, &url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(serde_json::to_vec(body)?);
        if let Some(token) = &self.access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = self.transport.execute(request, cancel).await?;
        debug!(url = %url, status = response.status, "API call finished");
        decode_envelope(&response)
    }
}

/// Decodes an envelope response.
///
/// The envelope decides success, not the HTTP status; a body that is not
/// an envelope is reported with its status.
fn decode_envelope<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, ApiError> {
    let envelope: ApiEnvelope = match serde_json::from_slice(&response.body) {
        Ok(env) => env,
        Err(e) if response.is_success() => return Err(ApiError::Json(e)),
        Err(_) => {
            return Err(ApiError::Http {
                status: response.status,
                body: response.text(),
            });
        }
    };

    match envelope.result {
        ResultKind::Success => Ok(envelope.parse_data()?),
        ResultKind::Error | ResultKind::Redirect => Err(ApiError::Envelope {
            status: response.status,
            message: envelope.error_message(),
            token: envelope.token,
        }),
    }
}
