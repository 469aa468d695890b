use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Outcome marker of a REST response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Error,
    Redirect,
}

/// Envelope wrapping every REST API response.
///
/// Success: `{"result":"success","data":{...}}`.
/// Failure: `{"result":"error","error":"<message>","token":"<code>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub result: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ApiEnvelope {
    /// Creates a success envelope around `data`.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            result: ResultKind::Success,
            data: Some(data),
            error: None,
            token: None,
        }
    }

    /// Creates an error envelope.
    pub fn error(message: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            result: ResultKind::Error,
            data: None,
            error: Some(message.into()),
            token: Some(token.into()),
        }
    }

    /// Returns `true` if `result` is `success`.
    pub fn is_success(&self) -> bool {
        self.result == ResultKind::Success
    }

    /// Deserializes `data` into the given type.
    ///
    /// A missing `data` field is treated as JSON `null`.
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            Some(v) => T::deserialize(v),
            None => T::deserialize(serde_json::Value::Null),
        }
    }

    /// Error message, falling back to the token, then to a generic text.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.token.clone())
            .unwrap_or_else(|| "unknown error".into())
    }
}
