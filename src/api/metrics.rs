//! Prometheus-compatible `/metrics` endpoint.
//!
//! All metrics are derived from the in-memory ring-buffer window. Because the
//! buffer has a fixed capacity, values represent a **sliding window** of recent
//! requests rather than lifetime counters. Use `TYPE gauge` throughout for
//! semantic accuracy — values may decrease as old entries rotate out.
//!
//! Metric families:
//! - `gateway_window_size`         — entries currently in the ring buffer
//! - `gateway_requests`            — per-router/dialect/outcome request counts
//! - `gateway_latency_ms_sum`      — sum of latencies per router (for avg)
//! - `gateway_latency_ms_count`    — denominator matching the sum above
//! - `gateway_failovers_total`     — requests that failed over to another candidate
//! - `gateway_errors_total`        — requests that returned an error

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::state::GatewayState;

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/metrics", get(metrics)).with_state(state)
}

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut failovers: u64 = 0;
    let mut errors: u64 = 0;

    // (router_name, dialect, success) → count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // router_name → (latency_sum_ms, count)
    let mut latency: HashMap<String, (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.failed_over {
            failovers += 1;
        }
        if !e.success {
            errors += 1;
        }

        *request_counts.entry((e.router_name.clone(), e.dialect.clone(), e.success)).or_default() += 1;

        let lat = latency.entry(e.router_name.clone()).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP gateway_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE gateway_window_size gauge\n");
    out.push_str(&format!("gateway_window_size {window_size}\n\n"));

    out.push_str("# HELP gateway_requests Request count in the current window, labelled by router, dialect, and outcome.\n");
    out.push_str("# TYPE gateway_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((router_name, dialect, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "gateway_requests{{router=\"{router_name}\",dialect=\"{dialect}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP gateway_latency_ms_sum Sum of request latency (ms) in the current window, grouped by router.\n");
    out.push_str("# TYPE gateway_latency_ms_sum gauge\n");
    out.push_str("# HELP gateway_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE gateway_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for (router_name, (sum, count)) in lat_rows {
        out.push_str(&format!("gateway_latency_ms_sum{{router=\"{router_name}\"}} {sum}\n"));
        out.push_str(&format!("gateway_latency_ms_count{{router=\"{router_name}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP gateway_failovers_total Requests that failed over to another candidate in the current window.\n");
    out.push_str("# TYPE gateway_failovers_total gauge\n");
    out.push_str(&format!("gateway_failovers_total {failovers}\n\n"));

    out.push_str("# HELP gateway_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE gateway_errors_total gauge\n");
    out.push_str(&format!("gateway_errors_total {errors}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}
