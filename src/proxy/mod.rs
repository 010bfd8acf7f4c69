//! Key-rotating proxy: a single JSON endpoint that keeps upstream API keys
//! server-side. Text actions fan out across the key pool with failover; the
//! voice action hands a random key to the client for its direct live
//! connection.

pub mod keypool;
pub mod upstream;

pub use keypool::{KEYS_ENV_VAR, KeyPool};
pub use upstream::{DEFAULT_TEXT_MODEL, DEFAULT_UPSTREAM_BASE, GeminiUpstream, Upstream, UpstreamError};

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::Value;
use tracing::{info, warn};

use crate::types::{
    ChatPayload, ChatTurn, ErrorResponse, GenerateRequest, GenerationConfig, MentalMapPayload,
    ProxyRequest, TextContent, TextResponse, VoiceKeyResponse,
};

pub const PROXY_ROUTE: &str = "/api/proxy";

pub struct ProxyState<U> {
    pub keys: Arc<KeyPool>,
    pub upstream: Arc<U>,
}

impl<U> Clone for ProxyState<U> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

pub fn router<U: Upstream>(state: ProxyState<U>) -> axum::Router {
    axum::Router::new()
        .route(PROXY_ROUTE, post(handle_action::<U>))
        .with_state(state)
}

async fn handle_action<U: Upstream>(
    State(state): State<ProxyState<U>>,
    Json(body): Json<Value>,
) -> Response {
    let request: ProxyRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            warn!("[Proxy] Rejecting request: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "unknown action");
        }
    };

    match request {
        ProxyRequest::GetVoiceKey(_) => match state.keys.random_key() {
            Some(key) => {
                info!("[Proxy] Issued a voice session key");
                Json(VoiceKeyResponse {
                    api_key: key.to_string(),
                })
                .into_response()
            }
            None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "No API keys configured"),
        },
        ProxyRequest::Chat(payload) => {
            generate(&state, chat_request(payload)).await
        }
        ProxyRequest::MentalMap(payload) => {
            generate(&state, mental_map_request(payload)).await
        }
    }
}

async fn generate<U: Upstream>(state: &ProxyState<U>, request: GenerateRequest) -> Response {
    match state.keys.execute_with_failover(&*state.upstream, &request).await {
        Ok(text) => Json(TextResponse { text }).into_response(),
        Err(UpstreamError::BadRequest(detail)) => {
            error_response(StatusCode::BAD_REQUEST, &format!("bad request: {detail}"))
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn chat_request(payload: ChatPayload) -> GenerateRequest {
    let mut contents = payload.history;
    contents.push(ChatTurn::new("user", payload.message));
    GenerateRequest {
        contents,
        system_instruction: if payload.system_instruction.is_empty() {
            None
        } else {
            Some(TextContent::from_text(payload.system_instruction))
        },
        generation_config: Some(GenerationConfig {
            temperature: Some(0.7),
            ..Default::default()
        }),
    }
}

fn mental_map_request(payload: MentalMapPayload) -> GenerateRequest {
    let prompt = format!(
        "Create a mental map (study outline) in English for the topic: \"{}\".\n\
         Render it as a plain-text tree using the characters ├──, └── and │ \
         for branches. Start with the topic as the root line. Keep it to at \
         most three levels and short node labels. Do not use markdown code \
         blocks or any other formatting.",
        payload.topic
    );
    GenerateRequest {
        contents: vec![ChatTurn::new("user", prompt)],
        system_instruction: None,
        generation_config: None,
    }
}
