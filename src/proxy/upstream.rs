//! Upstream model call the proxy fans out to, one attempt per API key.

use thiserror::Error;
use tracing::debug;

use crate::types::{GenerateRequest, GenerateResponse};

pub const DEFAULT_UPSTREAM_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";

/// Failure classification that drives key rotation: a `BadRequest` means the
/// request itself is broken and trying other keys is pointless; everything
/// else is attributable to the key or the upstream and rotates.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no API keys configured")]
    NoKeys,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream call failed: {0}")]
    Failed(String),
}

/// One generateContent call with one key. Seam for the key pool's failover
/// tests.
pub trait Upstream: Send + Sync + 'static {
    fn generate(
        &self,
        api_key: &str,
        request: &GenerateRequest,
    ) -> impl Future<Output = Result<String, UpstreamError>> + Send;
}

/// Production upstream over the hosted REST API.
#[derive(Debug, Clone)]
pub struct GeminiUpstream {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiUpstream {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

impl Default for GeminiUpstream {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_BASE, DEFAULT_TEXT_MODEL)
    }
}

impl Upstream for GeminiUpstream {
    fn generate(
        &self,
        api_key: &str,
        request: &GenerateRequest,
    ) -> impl Future<Output = Result<String, UpstreamError>> + Send {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );
        let http = self.http.clone();
        let body = serde_json::to_value(request);

        async move {
            let body = body.map_err(|e| UpstreamError::Failed(format!("serialization: {e}")))?;
            debug!("[Upstream] POST generateContent");
            let response = http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| UpstreamError::Failed(format!("network: {e}")))?;

            let status = response.status();
            if status == reqwest::StatusCode::BAD_REQUEST {
                let detail = response.text().await.unwrap_or_default();
                return Err(UpstreamError::BadRequest(detail));
            }
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(UpstreamError::Failed(format!("{status}: {detail}")));
            }

            let parsed: GenerateResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::Failed(format!("unexpected response shape: {e}")))?;
            Ok(parsed.text())
        }
    }
}
