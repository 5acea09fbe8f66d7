//! Admin API — operator-facing introspection endpoints, bound to the
//! admin port so they can be network-restricted independently of the
//! client-facing surface.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::GatewayState;

/// Build the admin-facing axum router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/backends/health", get(backends_health))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::api::admin_auth::admin_auth_middleware,
        ))
        .with_state(state)
}

/// GET /admin/health — liveness plus a coarse count of what's configured.
pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let config = state.config();
    let backend_count: usize = config.models.values().map(|g| g.endpoints.len()).sum();
    Json(json!({
        "status": "ok",
        "model_groups": config.models.len(),
        "backends": backend_count,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N — recent N traffic entries (default 100) plus aggregate stats.
pub async fn traffic(State(state): State<Arc<GatewayState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({
        "stats": stats,
        "entries": entries,
    }))
}

/// GET /admin/config — current config with secrets redacted.
pub async fn config(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let cfg = state.config();

    let models: Value = cfg
        .models
        .iter()
        .map(|(group_name, group)| {
            let endpoints: Vec<Value> = group
                .endpoints
                .iter()
                .map(|e| {
                    json!({
                        "backend_mode": e.backend_mode,
                        "backend_type": format!("{:?}", e.backend_type),
                        "base_url": e.base_url,
                        "api_key_set": e.api_key.is_some(),
                        "compression_enabled": e.compression_enabled,
                    })
                })
                .collect();
            (
                group_name.clone(),
                json!({
                    "description": group.description,
                    "available_models": group.available_models.keys().collect::<Vec<_>>(),
                    "endpoints": endpoints,
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
            "admin_auth_enabled": cfg.gateway.admin_token_env.is_some(),
        },
        "proxy": cfg.proxy,
        "local_ollama": {
            "base_url": cfg.local_ollama.base_url,
            "simulate_down": cfg.local_ollama.simulate_down,
        },
        "routing": cfg.routing,
        "models": models,
    }))
}

/// GET /admin/backends/health — probes every configured backend endpoint
/// (and the local daemon) with a cheap HEAD request through the shared pool.
pub async fn backends_health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let cfg = state.config();
    let mut results = Vec::new();

    for (group_name, group) in &cfg.models {
        for endpoint in &group.endpoints {
            let label = format!("{group_name}.{}", endpoint.backend_mode);
            match state.pool.acquire(endpoint).await {
                Ok(pooled) => match pooled.client.head(&endpoint.base_url).send().await {
                    Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                        results.push(json!({ "router": label, "status": "ok" }));
                    }
                    Ok(resp) => {
                        results.push(json!({ "router": label, "status": "unreachable", "http_status": resp.status().as_u16() }));
                    }
                    Err(e) => {
                        results.push(json!({ "router": label, "status": "unreachable", "error": e.to_string() }));
                    }
                },
                Err(e) => {
                    results.push(json!({ "router": label, "status": "error", "error": e.to_string() }));
                }
            }
        }
    }

    if let Ok(pooled) = state.pool.acquire(&crate::config::BackendEndpoint::local(&cfg.local_ollama.base_url)).await {
        let up = state.local_probe.is_up(&pooled.client, &cfg.local_ollama.base_url).await;
        results.push(json!({ "router": "local", "status": if up { "ok" } else { "unreachable" } }));
    }

    let all_ok = results.iter().all(|r| r["status"] == "ok");
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };

    (status, Json(json!({ "backends": results })))
}
