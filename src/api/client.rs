//! Client-facing API (§4.8/C8) — the Ollama/OpenAI-dialect surface bound to
//! the gateway's client port.
//!
//! Handlers are thin: parse the inbound shape, hand off to [`dispatch`], and
//! translate the outcome back into an HTTP response. All routing, failover,
//! and shape-translation logic lives in [`crate::dispatch`] and
//! [`crate::resolver`].

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::{
    backends::{ByteStream, DispatchResponse},
    config::BackendEndpoint,
    dispatch::{self, Dialect},
    error::GatewayError,
    state::GatewayState,
    traffic::TrafficEntry,
};

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/api/tags", get(api_tags))
        .route("/api/generate", post(api_generate))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/show", post(api_show))
        .route("/api/version", get(api_version))
        .route("/api/{*path}", any(api_passthrough))
        .with_state(state)
}

/// Lenient body decode (§4.8): strict UTF-8 JSON first, falling back to
/// lossy re-decoding before giving up with a `DecodeError`.
fn parse_body(bytes: &[u8]) -> Result<Value, GatewayError> {
    if let Ok(value) = serde_json::from_slice(bytes) {
        return Ok(value);
    }
    let lossy = String::from_utf8_lossy(bytes);
    serde_json::from_str(&lossy).map_err(|e| GatewayError::DecodeError(e.to_string()))
}

fn body_to_axum(stream: ByteStream, content_type: &'static str) -> Response {
    let body = Body::from_stream(stream.map(Ok::<_, std::io::Error>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .expect("building a streaming response with a fixed content type never fails")
}

/// Picks the wire content type for a streamed `/api/generate` response.
/// Streams are forwarded with whatever framing the upstream actually used —
/// SSE when the outbound body was chat-shaped (dispatched to an OpenAI-style
/// candidate), NDJSON when it kept its original Ollama generate shape
/// (dispatched to the local daemon, or to mock while the daemon is down).
fn generate_stream_content_type(outbound: &Value) -> &'static str {
    if outbound.get("messages").is_some() {
        "text/event-stream"
    } else {
        "application/x-ndjson"
    }
}

async fn local_client(state: &GatewayState) -> Result<crate::pool::PooledClient, GatewayError> {
    let endpoint = BackendEndpoint::local(&state.config().local_ollama.base_url);
    state.pool.acquire(&endpoint).await
}

/// GET /api/tags
async fn api_tags(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let config = state.config();
    let mut models = Vec::new();

    if let Ok(pooled) = local_client(&state).await {
        let url = format!("{}/api/tags", config.local_ollama.base_url);
        if let Ok(resp) = pooled.client.get(&url).send().await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(local_models) = body.get("models").and_then(|m| m.as_array()) {
                    models.extend(local_models.iter().cloned());
                }
            }
        }
    }

    for (group_name, group) in &config.models {
        if group_name == "local" {
            continue;
        }
        for (virtual_name, details) in &group.available_models {
            let full_name = format!("{group_name}/{virtual_name}");
            let mut entry = json!({
                "name": full_name,
                "model": full_name,
                "modified_at": chrono::Utc::now().to_rfc3339(),
                "size": 0,
                "digest": "",
                "details": {
                    "parent_model": "",
                    "format": "api",
                    "family": group_name,
                    "families": [group_name],
                    "parameter_size": "",
                    "quantization_level": "",
                },
            });
            if let Some(endpoint) = group.endpoints.first() {
                if let Some(obj) = entry.as_object_mut() {
                    obj.insert("remote_model".to_string(), json!(details.actual_model));
                    obj.insert("remote_host".to_string(), json!(endpoint.base_url));
                }
            }
            models.push(entry);
        }
    }

    Json(json!({ "models": models }))
}

/// POST /api/generate
async fn api_generate(State(state): State<Arc<GatewayState>>, body: axum::body::Bytes) -> Response {
    let started = Instant::now();
    let request = match parse_body(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let model = request.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let stream = request.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let prompt = request.get("prompt").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let is_local = state.resolver().resolve(&model).map(|r| r.model_group == "local").unwrap_or(false);

    let outbound = if is_local {
        request.clone()
    } else {
        let options = request.get("options").cloned().unwrap_or(json!({}));
        let temperature = options.get("temperature").and_then(|v| v.as_f64()).unwrap_or(0.7);
        let max_tokens = options.get("num_predict").and_then(|v| v.as_u64()).unwrap_or(2048);
        json!({
            "messages": [{"role": "user", "content": prompt}],
            "stream": stream,
            "temperature": temperature,
            "max_tokens": max_tokens,
        })
    };
    let stream_content_type = generate_stream_content_type(&outbound);

    match dispatch::dispatch(&state, &model, outbound, stream, Dialect::Ollama).await {
        Ok(outcome) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let entry = TrafficEntry::new(outcome.router_name.clone(), Dialect::Ollama.as_str().to_string(), stream, latency_ms, true)
                .with_requested_model(&model)
                .with_model_group(&outcome.model_group);
            let entry = if outcome.failed_over { entry.mark_failed_over() } else { entry };
            state.traffic.push(entry);

            match outcome.response {
                DispatchResponse::Once(value) => (StatusCode::OK, Json(value)).into_response(),
                DispatchResponse::Stream(s, _metrics) => body_to_axum(s, stream_content_type),
            }
        }
        Err(err) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let entry = TrafficEntry::new("unresolved".to_string(), Dialect::Ollama.as_str().to_string(), stream, latency_ms, false)
                .with_requested_model(&model)
                .with_error(&err.to_string());
            state.traffic.push(entry);
            err.into_response()
        }
    }
}

/// POST /v1/chat/completions
async fn chat_completions(State(state): State<Arc<GatewayState>>, body: axum::body::Bytes) -> Response {
    let started = Instant::now();
    let request = match parse_body(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let model = request.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let stream = request.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    match dispatch::dispatch(&state, &model, request, stream, Dialect::OpenAi).await {
        Ok(outcome) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let entry = TrafficEntry::new(outcome.router_name.clone(), Dialect::OpenAi.as_str().to_string(), stream, latency_ms, true)
                .with_requested_model(&model)
                .with_model_group(&outcome.model_group);
            let entry = if outcome.failed_over { entry.mark_failed_over() } else { entry };
            state.traffic.push(entry);

            match outcome.response {
                DispatchResponse::Once(value) => (StatusCode::OK, Json(value)).into_response(),
                DispatchResponse::Stream(s, _metrics) => body_to_axum(s, "text/event-stream"),
            }
        }
        Err(err) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let entry = TrafficEntry::new("unresolved".to_string(), Dialect::OpenAi.as_str().to_string(), stream, latency_ms, false)
                .with_requested_model(&model)
                .with_error(&err.to_string());
            state.traffic.push(entry);
            err.into_response()
        }
    }
}

/// POST /api/show
async fn api_show(State(state): State<Arc<GatewayState>>, body: axum::body::Bytes) -> Response {
    let request = match parse_body(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let model = request.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let Some(resolved) = state.resolver().resolve(&model) else {
        return GatewayError::NotFound(format!("model `{model}` does not resolve")).into_response();
    };

    if resolved.model_group != "local" {
        let remote = resolved.candidates.first().and_then(|c| c.endpoint.clone());
        let descriptor = json!({
            "modelfile": format!("# synthesized descriptor for {}/{}", resolved.model_group, resolved.virtual_model),
            "parameters": "",
            "template": "",
            "details": {
                "format": "api",
                "family": resolved.model_group,
                "families": [resolved.model_group],
                "parameter_size": "",
                "quantization_level": "",
            },
            "capabilities": resolved.capabilities,
            "remote_model": resolved.candidates.first().map(|c| c.actual_model.clone()),
            "remote_host": remote.map(|e| e.base_url),
        });
        return (StatusCode::OK, Json(descriptor)).into_response();
    }

    match local_client(&state).await {
        Ok(pooled) => {
            let url = format!("{}/api/show", state.config().local_ollama.base_url);
            match pooled.client.post(&url).json(&request).send().await {
                Ok(resp) => match resp.json::<Value>().await {
                    Ok(value) => Json(value).into_response(),
                    Err(e) => GatewayError::DecodeError(e.to_string()).into_response(),
                },
                Err(e) => GatewayError::TransportError(e.to_string()).into_response(),
            }
        }
        Err(e) => e.into_response(),
    }
}

/// GET /api/version
async fn api_version(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let fallback = || Json(json!({"version": "0.6.4", "mock": true}));

    let Ok(pooled) = local_client(&state).await else {
        return fallback();
    };
    let url = format!("{}/api/version", state.config().local_ollama.base_url);
    match pooled.client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
            Ok(value) => Json(value),
            Err(_) => fallback(),
        },
        _ => fallback(),
    }
}

/// ANY /api/{path} — generic passthrough to the local daemon.
async fn api_passthrough(
    State(state): State<Arc<GatewayState>>,
    Path(path): Path<String>,
    method: axum::http::Method,
    body: axum::body::Bytes,
) -> Response {
    let Ok(pooled) = local_client(&state).await else {
        return canned_passthrough_fallback(&path);
    };

    let url = format!("{}/api/{path}", state.config().local_ollama.base_url);
    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    let mut builder = pooled.client.request(reqwest_method, &url);
    if !body.is_empty() {
        builder = builder.body(body.to_vec());
    }

    match builder.send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match resp.bytes().await {
                Ok(bytes) => (status, bytes).into_response(),
                Err(_) => canned_passthrough_fallback(&path),
            }
        }
        Err(_) => canned_passthrough_fallback(&path),
    }
}

fn canned_passthrough_fallback(path: &str) -> Response {
    match path {
        "pull" | "delete" | "copy" => (StatusCode::OK, Json(json!({"status": "success"}))).into_response(),
        _ => GatewayError::UpstreamError { status: 502, text: "local daemon unreachable".to_string() }.into_response(),
    }
}
