//! Client configuration.
//!
//! Every field has a serde default so partial TOML or JSON documents load.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use klb_upload_protocol::constants::DEFAULT_MAX_CONCURRENCY;
use klb_upload_transfer::RetryPolicy;

/// How the client treats the SHA-256 reported at completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashPolicy {
    /// Accept the server's digest as-is.
    #[default]
    TrustServer,
    /// Hash the source locally and fail completion on a mismatch.
    Verify,
}

/// Upload client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL that relative endpoints are joined to.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bearer token sent on API calls (never to PUT URLs or S3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Concurrent chunk transfers per session.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub hash_policy: HashPolicy,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-request ceiling, including body upload.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://www.atonline.com/_special/rest".into()
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            access_token: None,
            max_concurrency: default_max_concurrency(),
            retry: RetrySettings::default(),
            hash_policy: HashPolicy::default(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-chunk retry settings, in config-file units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_true(),
        }
    }
}

impl RetrySettings {
    /// Converts to the engine's policy. At least one attempt is always made.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
        }
    }
}
