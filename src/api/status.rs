//! Public status endpoint (`GET /status`) — bound to the client port.
//!
//! Safe to expose publicly without authentication. Returns gateway liveness
//! and aggregate metrics only.
//!
//! What this endpoint **does not** include:
//! - Router/backend names or URLs
//! - Model group names
//! - Routing configuration
//! - Any value that could reveal internal infrastructure

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::state::GatewayState;

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/status", get(status)).with_state(state)
}

/// `GET /status` — public liveness and metrics endpoint.
///
/// `ready` is `false` when one or more configured backend endpoints declare
/// an `api_key` that failed to resolve to a non-empty value. No router or
/// model-group names are exposed — only the boolean.
pub async fn status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let config = state.config();
    let uptime_secs = state.started_at.elapsed().as_secs();
    let stats = state.traffic.stats().await;

    let error_rate = if stats.total_requests == 0 { 0.0_f64 } else { stats.error_count as f64 / stats.total_requests as f64 };

    let unconfigured = config
        .models
        .values()
        .flat_map(|g| &g.endpoints)
        .filter(|e| e.api_key.as_deref().map(|k| k.is_empty()).unwrap_or(false))
        .count();
    let ready = unconfigured == 0;

    let mut body = json!({
        "status": "ok",
        "ready": ready,
        "uptime_secs": uptime_secs,
        "requests": {
            "total": stats.total_requests,
            "errors": stats.error_count,
            "error_rate": error_rate,
            "failovers": stats.failover_count,
            "avg_latency_ms": stats.avg_latency_ms,
        }
    });

    if !ready {
        body["setup_url"] = serde_json::Value::String("https://github.com/ggml-org/llama.cpp".to_string());
    }

    Json(body)
}
