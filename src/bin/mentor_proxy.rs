//! Standalone proxy server. Keys come from `MENTOR_API_KEYS` (comma
//! separated); the bind address, upstream base URL and text model are
//! overridable through the environment.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mentor_live::proxy::{
    self, DEFAULT_TEXT_MODEL, DEFAULT_UPSTREAM_BASE, GeminiUpstream, KeyPool, ProxyState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let keys = KeyPool::from_env();
    if keys.is_empty() {
        warn!(
            "[Proxy] No keys in {}; every model action will answer 500",
            proxy::KEYS_ENV_VAR
        );
    }

    let base_url = std::env::var("MENTOR_UPSTREAM_URL")
        .unwrap_or_else(|_| DEFAULT_UPSTREAM_BASE.to_string());
    let model =
        std::env::var("MENTOR_TEXT_MODEL").unwrap_or_else(|_| DEFAULT_TEXT_MODEL.to_string());
    let addr =
        std::env::var("MENTOR_PROXY_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());

    let state = ProxyState {
        keys: Arc::new(keys),
        upstream: Arc::new(GeminiUpstream::new(base_url, model)),
    };
    let app = proxy::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[Proxy] Listening on {}{}", addr, proxy::PROXY_ROUTE);
    axum::serve(listener, app).await?;
    Ok(())
}
