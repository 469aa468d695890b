use std::collections::BTreeMap;
use std::num::NonZeroU64;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;
use crate::types::{CompletionResult, NegotiationResult, UploadRequest};

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

/// Body of the negotiation POST.
///
/// Application parameters are flattened next to the file metadata; a
/// parameter named like one of the metadata fields is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateRequest {
    pub filename: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Unix milliseconds.
    pub last_modified: i64,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

const RESERVED_NEGOTIATION_KEYS: [&str; 4] = ["filename", "size", "type", "lastModified"];

impl From<&UploadRequest> for NegotiateRequest {
    fn from(req: &UploadRequest) -> Self {
        let params = req
            .params
            .iter()
            .filter(|(k, _)| !RESERVED_NEGOTIATION_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            filename: req.filename.clone(),
            size: req.size,
            mime_type: req.mime_type.clone(),
            last_modified: req.last_modified.timestamp_millis(),
            params,
        }
    }
}

/// S3 bucket location from an S3 negotiation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Raw `data` of a negotiation response, before the method is decided.
///
/// `PUT` marks a direct PUT upload, `Cloud_Aws_Bucket_Upload__` marks an S3
/// multipart upload. Every other field is kept in `other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationData {
    #[serde(rename = "PUT", default, skip_serializing_if = "Option::is_none")]
    pub put: Option<String>,
    #[serde(rename = "Complete", default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<String>,
    /// Number or numeric string.
    #[serde(rename = "Blocksize", default, skip_serializing_if = "Option::is_none")]
    pub blocksize: Option<serde_json::Value>,
    #[serde(
        rename = "Cloud_Aws_Bucket_Upload__",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cloud_aws_bucket_upload: Option<String>,
    #[serde(rename = "Bucket_Endpoint", default, skip_serializing_if = "Option::is_none")]
    pub bucket_endpoint: Option<BucketEndpoint>,
    #[serde(rename = "Key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl NegotiationData {
    /// Decides the upload method and validates the fields it requires.
    pub fn classify(self) -> Result<NegotiationResult, ProtocolError> {
        match (&self.put, &self.cloud_aws_bucket_upload) {
            (Some(_), Some(_)) => Err(ProtocolError::InvalidField {
                field: "PUT",
                reason: "response carries both direct PUT and S3 upload fields".into(),
            }),
            (Some(_), None) => self.into_direct_put(),
            (None, Some(_)) => self.into_s3(),
            (None, None) => Err(ProtocolError::UnsupportedMethod(self.field_names())),
        }
    }

    fn into_direct_put(self) -> Result<NegotiationResult, ProtocolError> {
        const CTX: &str = "direct PUT";
        let put_url = required(self.put, CTX, "PUT")?;
        let complete_endpoint = required(self.complete, CTX, "Complete")?;
        let block_size = match self.blocksize {
            Some(v) => parse_block_size(&v)?,
            None => None,
        };
        Ok(NegotiationResult::DirectPut {
            put_url,
            complete_endpoint,
            block_size,
        })
    }

    fn into_s3(self) -> Result<NegotiationResult, ProtocolError> {
        const CTX: &str = "S3 multipart";
        let upload_session_id = required(self.cloud_aws_bucket_upload, CTX, "Cloud_Aws_Bucket_Upload__")?;
        let endpoint = self.bucket_endpoint.ok_or(ProtocolError::MissingField {
            context: CTX,
            field: "Bucket_Endpoint",
        })?;
        Ok(NegotiationResult::S3Multipart {
            upload_session_id,
            bucket_host: required(endpoint.host, CTX, "Bucket_Endpoint.Host")?,
            bucket_name: required(endpoint.name, CTX, "Bucket_Endpoint.Name")?,
            region: required(endpoint.region, CTX, "Bucket_Endpoint.Region")?,
            object_key: required(self.key, CTX, "Key")?,
        })
    }

    fn field_names(&self) -> String {
        let mut names: Vec<&str> = Vec::new();
        if self.complete.is_some() {
            names.push("Complete");
        }
        if self.blocksize.is_some() {
            names.push("Blocksize");
        }
        if self.bucket_endpoint.is_some() {
            names.push("Bucket_Endpoint");
        }
        if self.key.is_some() {
            names.push("Key");
        }
        names.extend(self.other.keys().map(String::as_str));
        if names.is_empty() {
            "none".into()
        } else {
            names.join(", ")
        }
    }
}

fn required(
    value: Option<String>,
    context: &'static str,
    field: &'static str,
) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProtocolError::MissingField { context, field }),
    }
}

/// `Blocksize` as a positive integer; `0`, `null` and `""` mean "no limit".
fn parse_block_size(value: &serde_json::Value) -> Result<Option<NonZeroU64>, ProtocolError> {
    let invalid = |reason: String| ProtocolError::InvalidField {
        field: "Blocksize",
        reason,
    };
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(NonZeroU64::new)
            .ok_or_else(|| invalid(format!("not a non-negative integer: {n}"))),
        serde_json::Value::String(s) if s.is_empty() => Ok(None),
        serde_json::Value::String(s) => s
            .parse::<u64>()
            .map(NonZeroU64::new)
            .map_err(|e| invalid(format!("{s:?}: {e}"))),
        other => Err(invalid(format!("unexpected value {other}"))),
    }
}

// ---------------------------------------------------------------------------
// SigV4 signing
// ---------------------------------------------------------------------------

/// Asks the API to sign one outbound S3 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignV4Request {
    pub method: String,
    pub host: String,
    /// Path plus canonical query string, e.g. `/bucket/key?partNumber=1&uploadId=x`.
    pub uri: String,
    /// Headers covered by the signature, lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Hex SHA-256 of the request body.
    pub hash: String,
}

/// Signing result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignV4Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Raw `data` of a completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionData {
    #[serde(rename = "Blob__", default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    #[serde(rename = "SHA256", default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Sent by the server as a decimal string; numbers are accepted too.
    #[serde(
        rename = "Size",
        default,
        deserialize_with = "de_string_or_u64",
        serialize_with = "ser_u64_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u64>,
    #[serde(rename = "Mime", default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl CompletionData {
    /// Converts into a [`CompletionResult`].
    ///
    /// `fallback_mime` is used when the server omits `Mime`.
    pub fn into_result(self, fallback_mime: &str) -> Result<CompletionResult, ProtocolError> {
        const CTX: &str = "completion";
        let blob_id = required(self.blob, CTX, "Blob__")?;
        let size_bytes = self.size.ok_or(ProtocolError::MissingField {
            context: CTX,
            field: "Size",
        })?;
        Ok(CompletionResult {
            blob_id,
            sha256: self.sha256.filter(|s| !s.is_empty()),
            size_bytes,
            mime_type: self
                .mime
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| fallback_mime.to_string()),
            extra: self.other,
        })
    }
}

fn de_string_or_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid size {n}"))),
        Some(serde_json::Value::String(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|e| D::Error::custom(format!("invalid size {s:?}: {e}"))),
        Some(other) => Err(D::Error::custom(format!("invalid size {other}"))),
    }
}

fn ser_u64_as_string<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&v.to_string()),
        None => serializer.serialize_none(),
    }
}
