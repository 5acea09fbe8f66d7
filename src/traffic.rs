//! In-memory traffic log exposed through the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let failover_count = entries.iter().filter(|e| e.failed_over).count();

        let mut router_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *router_counts.entry(entry.router_name.clone()).or_default() += 1;
        }

        TrafficStats { total_requests: total, error_count, failover_count, avg_latency_ms, router_counts }
    }
}

/// A single request record — §3 `TrafficEntry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique request ID (mirrors the `X-Request-ID` set on the response).
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Model string as sent by the client, before resolution.
    pub requested_model: Option<String>,
    /// Model group the resolver placed it in.
    pub model_group: Option<String>,
    /// Name of the router that ultimately served the request (or attempted to).
    pub router_name: String,
    /// `"ollama"` or `"openai"` — the inbound dialect this request arrived in.
    pub dialect: String,
    /// Whether this was a streamed request.
    pub stream: bool,
    /// Whether at least one earlier candidate was tried and failed before this one.
    pub failed_over: bool,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(router_name: String, dialect: String, stream: bool, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            requested_model: None,
            model_group: None,
            router_name,
            dialect,
            stream,
            failed_over: false,
            latency_ms,
            success,
            error: None,
        }
    }

    pub fn with_requested_model(mut self, model: &str) -> Self {
        self.requested_model = Some(model.to_string());
        self
    }

    pub fn with_model_group(mut self, group: &str) -> Self {
        self.model_group = Some(group.to_string());
        self
    }

    pub fn mark_failed_over(mut self) -> Self {
        self.failed_over = true;
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub failover_count: usize,
    pub avg_latency_ms: f64,
    pub router_counts: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(router_name: &str, latency_ms: u64) -> TrafficEntry {
        TrafficEntry::new(router_name.into(), "ollama".into(), false, latency_ms, true)
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry("demo.primary_backend", 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].router_name, "demo.primary_backend");
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 1));
        log.push(make_entry("b", 2));
        log.push(make_entry("c", 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].router_name, "c");
        assert_eq!(recent[1].router_name, "b");
        assert_eq!(recent[2].router_name, "a");
    }

    #[tokio::test]
    async fn recent_limits_result_count() {
        let log = TrafficLog::new(20);
        for i in 0..10u64 {
            log.push(make_entry("a", i));
        }
        let recent = log.recent(3).await;
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry("oldest", 1));
        log.push(make_entry("middle", 2));
        log.push(make_entry("newest", 3));
        log.push(make_entry("extra", 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.router_name == "oldest"));
        assert!(all.iter().any(|e| e.router_name == "extra"));
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = TrafficLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        assert!(stats.router_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_averages_latency_correctly() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 100));
        log.push(make_entry("a", 200));
        log.push(make_entry("b", 300));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_counts_requests_per_router() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 10));
        log.push(make_entry("a", 20));
        log.push(make_entry("b", 30));

        let stats = log.stats().await;
        assert_eq!(stats.router_counts["a"], 2);
        assert_eq!(stats.router_counts["b"], 1);
    }

    #[tokio::test]
    async fn stats_counts_failovers_separately_from_errors() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 10).mark_failed_over());
        log.push(TrafficEntry::new("b".into(), "ollama".into(), false, 20, false).with_error("boom"));

        let stats = log.stats().await;
        assert_eq!(stats.failover_count, 1);
        assert_eq!(stats.error_count, 1);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry("a", 1);
        let b = make_entry("a", 1);
        assert_ne!(a.id, b.id, "every entry must have a unique UUID");
    }

    #[test]
    fn entry_records_success_flag() {
        let ok = TrafficEntry::new("t".into(), "ollama".into(), false, 0, true);
        let err = TrafficEntry::new("t".into(), "ollama".into(), false, 0, false);
        assert!(ok.success);
        assert!(!err.success);
    }
}
