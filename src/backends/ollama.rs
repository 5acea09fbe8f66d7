//! Ollama driver (§4.4.2).
//!
//! Shape-based endpoint selection: a request carrying a `messages` array goes
//! to Ollama's OpenAI-compatible `/v1/chat/completions` (SSE when streamed);
//! anything else is assumed to be a `/api/generate`-shaped prompt request
//! (NDJSON when streamed). This covers both the `local` catch-all group and
//! any explicitly configured `*_backend` entry whose driver resolves to
//! `ollama` (§4.5).

use std::sync::Arc;

use serde_json::Value;

use crate::{
    cache::{self, RequestCaches},
    config::BackendEndpoint,
    error::GatewayError,
    pool::ClientPool,
};

use super::{apply_request_caches, ndjson_error_frame, post_and_respond, sse_error_frame, DispatchResponse};

pub struct OllamaRouter {
    pub endpoint: BackendEndpoint,
    pool: Arc<ClientPool>,
    caches: RequestCaches,
}

impl OllamaRouter {
    pub fn new(endpoint: BackendEndpoint, pool: Arc<ClientPool>) -> Self {
        Self { endpoint, pool, caches: RequestCaches::new() }
    }

    pub async fn dispatch(&self, mut request: Value, stream: bool) -> Result<DispatchResponse, GatewayError> {
        let session = cache::derive_session_id(&request);
        apply_request_caches(&self.caches, &session, &mut request);

        let pooled = self.pool.acquire(&self.endpoint).await?;
        let is_chat_shape = request.get("messages").is_some();

        if is_chat_shape {
            let url = format!("{}/v1/chat/completions", self.endpoint.base_url);
            post_and_respond(&pooled.client, &url, &request, stream, sse_error_frame).await
        } else {
            let url = format!("{}/api/generate", self.endpoint.base_url);
            post_and_respond(&pooled.client, &url, &request, stream, ndjson_error_frame).await
        }
    }

    /// Probes Ollama's root endpoint (`GET /`), which returns `200 Ollama is
    /// running` without needing a model loaded.
    pub async fn health_check(&self) -> Result<(), GatewayError> {
        let pooled = self.pool.acquire(&self.endpoint).await?;
        let response = pooled.client.get(format!("{}/", self.endpoint.base_url)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::upstream(response.status().as_u16(), "health check failed"))
        }
    }
}
