//! Client for the proxy backend: a single JSON endpoint multiplexing the
//! `chat`, `mental_map` and `get_voice_key` actions.
//!
//! The client holds an ordered list of candidate endpoints (for example a
//! deployed function URL and a local dev server) and walks it on every call,
//! returning the first successful response and keeping the last failure for
//! the error report when all candidates are down.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::error::MentorError;
use crate::session::CredentialSource;
use crate::types::{
    ChatPayload, ChatTurn, ErrorResponse, MentalMapPayload, ProxyRequest, TextResponse,
    VoiceKeyPayload, VoiceKeyResponse,
};

pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:3001/api/proxy";

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl BackendClient {
    pub fn new(endpoints: Vec<String>) -> Result<Self, MentorError> {
        if endpoints.is_empty() {
            return Err(MentorError::Internal(
                "backend client needs at least one endpoint".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MentorError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self { http, endpoints })
    }

    /// Client against a proxy running on the default local port.
    pub fn local() -> Result<Self, MentorError> {
        Self::new(vec![DEFAULT_LOCAL_ENDPOINT.to_string()])
    }

    /// Sends one action to the first endpoint that answers, deserializing the
    /// response as `T`. Any failure, network or HTTP or body shape, moves on
    /// to the next endpoint; the last failure becomes the reported error.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: &ProxyRequest,
    ) -> Result<T, MentorError> {
        let mut last_error = MentorError::Backend("no endpoints attempted".to_string());

        for endpoint in &self.endpoints {
            match self.call_one(endpoint, request).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("[Backend] Endpoint {} failed: {}", endpoint, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn call_one<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &ProxyRequest,
    ) -> Result<T, MentorError> {
        debug!("[Backend] POST {}", endpoint);
        let response = self
            .http
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| MentorError::Backend(format!("request to {endpoint} failed: {e}")))?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        let body = response
            .bytes()
            .await
            .map_err(|e| MentorError::Backend(format!("reading response body failed: {e}")))?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(MentorError::Backend(format!(
                "{endpoint} answered {status}: {detail}"
            )));
        }
        if !is_json {
            return Err(MentorError::Backend(format!(
                "{endpoint} answered with non-JSON content"
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| MentorError::Backend(format!("unexpected response shape: {e}")))
    }

    /// One text turn with conversation history.
    pub async fn chat(
        &self,
        history: Vec<ChatTurn>,
        message: impl Into<String>,
        system_instruction: impl Into<String>,
    ) -> Result<String, MentorError> {
        let response: TextResponse = self
            .call(&ProxyRequest::Chat(ChatPayload {
                history,
                message: message.into(),
                system_instruction: system_instruction.into(),
            }))
            .await?;
        Ok(response.text)
    }

    /// ASCII-tree study map for a topic.
    pub async fn mental_map(&self, topic: impl Into<String>) -> Result<String, MentorError> {
        let response: TextResponse = self
            .call(&ProxyRequest::MentalMap(MentalMapPayload {
                topic: topic.into(),
            }))
            .await?;
        Ok(response.text)
    }

    /// Fetches a key for the live voice connection.
    pub async fn voice_key(&self) -> Result<String, MentorError> {
        let response: VoiceKeyResponse = self
            .call(&ProxyRequest::GetVoiceKey(VoiceKeyPayload::default()))
            .await?;
        if response.api_key.trim().is_empty() {
            return Err(MentorError::Credential(
                "backend returned an empty API key".to_string(),
            ));
        }
        Ok(response.api_key)
    }
}

impl CredentialSource for BackendClient {
    fn voice_key(&self) -> impl Future<Output = Result<String, MentorError>> + Send {
        BackendClient::voice_key(self)
    }
}
