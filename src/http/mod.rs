use std::env;
use std::fmt;
use std::time::Duration;

use log::warn;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::types::RateLimitInfo;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

// Chat completions can run long on large prompts; key verification must not.
pub const CHAT_TIMEOUT_SECS: u64 = 90;
pub const MODELS_TIMEOUT_SECS: u64 = 30;

const ORGANIZATION_HEADER: &str = "OpenAI-Organization";

/// Failure surfaced by the upstream client. `status` is absent when the
/// transport failed before any HTTP status arrived (timeouts included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            status: None,
            message: err.to_string(),
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        Self {
            status: Some(status.as_u16()),
            message: body,
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "OpenAI error {}: {}", code, self.message),
            None => write!(f, "OpenAI request failed: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Body and headers of a successful chat-completion call. The body stays raw
/// JSON; the relay forwards it verbatim.
#[derive(Debug)]
pub struct ChatOutcome {
    pub body: Value,
    pub headers: HeaderMap,
}

/// Thin client for the OpenAI REST API.
pub struct Upstream {
    client: Client,
    api_base: String,
}

impl Upstream {
    /// Build against a specific API base (trailing slashes tolerated).
    pub fn new(api_base: impl Into<String>) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .use_rustls_tls()
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build against `OPENAI_API_BASE` from the environment, falling back to
    /// the public endpoint.
    pub fn from_env() -> reqwest::Result<Self> {
        let base = env::var("OPENAI_API_BASE").unwrap_or_else(|_| OPENAI_API_BASE.to_string());
        Self::new(base)
    }

    /// POST the payload to the chat-completions endpoint. Any non-2xx status
    /// comes back as an `UpstreamError` carrying the response body.
    pub async fn chat_completion(
        &self,
        api_key: &str,
        organization: Option<&str>,
        payload: &Value,
    ) -> Result<ChatOutcome, UpstreamError> {
        let url = format!("{}/chat/completions", self.api_base);
        let mut request = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .json(payload);
        if let Some(org) = organization {
            request = request.header(ORGANIZATION_HEADER, org);
        }
        let response = request.send().await.map_err(|e| {
            warn!("chat completion request failed: {}", e);
            UpstreamError::transport(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, text));
        }
        let headers = response.headers().clone();
        let body = response
            .json::<Value>()
            .await
            .map_err(UpstreamError::transport)?;
        Ok(ChatOutcome { body, headers })
    }

    /// GET the models listing to confirm the key works. Success is exactly
    /// status 200; anything else is an error with the upstream status and
    /// body attached.
    pub async fn list_models(
        &self,
        api_key: &str,
        organization: Option<&str>,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/models", self.api_base);
        let mut request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .timeout(Duration::from_secs(MODELS_TIMEOUT_SECS));
        if let Some(org) = organization {
            request = request.header(ORGANIZATION_HEADER, org);
        }
        let response = request.send().await.map_err(UpstreamError::transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, text));
        }
        Ok(())
    }
}

/// Pull OpenAI's `x-ratelimit-*` headers into a fresh snapshot tagged with
/// the model that served the request. Values that fail to parse stay unknown
/// rather than inheriting anything from an earlier snapshot.
pub fn extract_rate_limit(headers: &HeaderMap, model: &str) -> RateLimitInfo {
    let remaining_requests = header_number(headers, "x-ratelimit-remaining-requests");
    let remaining_tokens = header_number(headers, "x-ratelimit-remaining-tokens");
    // The reset header is a relative offset in seconds; anchor it to now.
    let reset_timestamp = headers
        .get("x-ratelimit-reset-requests")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .map(|offset| now_epoch() + offset);
    RateLimitInfo {
        model: Some(model.to_string()),
        remaining_requests,
        remaining_tokens,
        reset_timestamp,
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
