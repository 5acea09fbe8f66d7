//! OpenAI-compatible chat-completions driver (§4.4.1).
//!
//! Every non-Ollama, non-mock endpoint — DeepSeek, OpenRouter, a local
//! LiteLLM proxy, Anthropic fronted through its OpenAI-compatible shim — goes
//! through this driver. Anthropic gets no separate driver of its own: the
//! `x-api-key` vs. `Authorization: Bearer` header choice is already made by
//! [`crate::config::BackendEndpoint::from_config`] from the endpoint's host.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde_json::{json, Value};

use crate::{
    cache::{self, RequestCaches},
    config::BackendEndpoint,
    error::GatewayError,
    pool::ClientPool,
};

use super::{apply_request_caches, post_and_respond, sse_error_frame, DispatchResponse};

/// How long an `Unavailable` verdict is trusted before the SDK path is tried again.
const SDK_RECHECK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdkStatus {
    Unknown,
    #[allow(dead_code)]
    Available,
    Unavailable,
}

struct SdkState {
    status: SdkStatus,
    last_check: Option<Instant>,
}

/// §4.4.1 SDK-path state machine. No OpenAI SDK crate is wired into this
/// stack (see DESIGN.md) — `try_sdk` always reports unavailable, so every
/// request falls through to the HTTP path below. The state machine itself is
/// kept faithful to the design (including the recheck interval) in case a
/// real SDK client is ever plugged in behind it.
pub struct OpenAiRouter {
    pub endpoint: BackendEndpoint,
    pool: Arc<ClientPool>,
    caches: RequestCaches,
    sdk: Mutex<SdkState>,
}

impl OpenAiRouter {
    pub fn new(endpoint: BackendEndpoint, pool: Arc<ClientPool>) -> Self {
        Self {
            endpoint,
            pool,
            caches: RequestCaches::new(),
            sdk: Mutex::new(SdkState { status: SdkStatus::Unknown, last_check: None }),
        }
    }

    fn should_try_sdk(&self) -> bool {
        let sdk = self.sdk.lock().expect("sdk state mutex poisoned");
        !matches!(
            (sdk.status, sdk.last_check),
            (SdkStatus::Unavailable, Some(ts)) if ts.elapsed() < SDK_RECHECK_INTERVAL
        )
    }

    fn record_sdk_unavailable(&self) {
        let mut sdk = self.sdk.lock().expect("sdk state mutex poisoned");
        sdk.status = SdkStatus::Unavailable;
        sdk.last_check = Some(Instant::now());
    }

    pub async fn dispatch(
        &self,
        mut request: Value,
        stream: bool,
        support_thinking: bool,
    ) -> Result<DispatchResponse, GatewayError> {
        let session = cache::derive_session_id(&request);
        apply_request_caches(&self.caches, &session, &mut request);

        if self.should_try_sdk() {
            self.record_sdk_unavailable();
        }

        if support_thinking {
            apply_thinking_fields(&mut request);
        }

        let pooled = self.pool.acquire(&self.endpoint).await?;
        let url = format!("{}/chat/completions", self.endpoint.base_url);
        post_and_respond(&pooled.client, &url, &request, stream, sse_error_frame).await
    }

    pub async fn health_check(&self) -> Result<(), GatewayError> {
        let pooled = self.pool.acquire(&self.endpoint).await?;
        let response = pooled.client.head(&self.endpoint.base_url).send().await?;
        if response.status().is_success() || response.status().is_redirection() {
            Ok(())
        } else {
            Err(GatewayError::upstream(response.status().as_u16(), "health check failed"))
        }
    }
}

/// Sets `reasoning: true` and seeds an empty `reasoning_content` field on any
/// assistant message that doesn't already carry one, for upstreams that
/// expect thinking-capable models to echo it back turn over turn.
fn apply_thinking_fields(request: &mut Value) {
    let Some(obj) = request.as_object_mut() else { return };
    obj.insert("reasoning".to_string(), json!(true));

    let Some(messages) = obj.get_mut("messages").and_then(|m| m.as_array_mut()) else { return };
    for message in messages.iter_mut() {
        let is_assistant = message.get("role").and_then(|r| r.as_str()) == Some("assistant");
        let has_reasoning = message.get("reasoning_content").is_some();
        if is_assistant && !has_reasoning {
            if let Some(m) = message.as_object_mut() {
                m.insert("reasoning_content".to_string(), json!(""));
            }
        }
    }
}
