//! Local-model probe (§4.9) — decides whether the `local` router name should
//! be served by the real Ollama driver or fall back to `mock` at dispatch
//! time.
//!
//! The result is cached for [`PROBE_TTL`] so a busy dispatch loop never pays
//! for a network round-trip on every request; a background probe this cheap
//! (`GET /api/tags`, 1 s timeout) is still too slow to run inline on the hot
//! path for every candidate.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

const PROBE_TTL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cached liveness of the configured local Ollama daemon.
///
/// `last_checked` is stored as milliseconds since an arbitrary epoch
/// (`Instant` has no atomic representation); this is only ever compared to
/// itself within one process lifetime, so the epoch choice doesn't matter.
pub struct LocalProbe {
    up: AtomicBool,
    last_checked_ms: AtomicU64,
    epoch: Instant,
    /// When set, the probe always reports "down" regardless of the network —
    /// `[local_ollama].simulate_down` in config, handy for demos and tests
    /// that want deterministic mock fallback.
    simulate_down: bool,
}

impl LocalProbe {
    pub fn new(simulate_down: bool) -> Self {
        Self {
            up: AtomicBool::new(false),
            last_checked_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            simulate_down,
        }
    }

    /// Returns the cached liveness, refreshing it first if the cache entry
    /// has expired. A fresh process starts with a cold (expired) cache, so
    /// the first call always probes.
    pub async fn is_up(&self, client: &reqwest::Client, base_url: &str) -> bool {
        if self.simulate_down {
            return false;
        }

        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_checked_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < PROBE_TTL.as_millis() as u64 && last != 0 {
            return self.up.load(Ordering::Relaxed);
        }

        let up = probe_once(client, base_url).await;
        self.up.store(up, Ordering::Relaxed);
        self.last_checked_ms.store(now_ms.max(1), Ordering::Relaxed);
        up
    }
}

async fn probe_once(client: &reqwest::Client, base_url: &str) -> bool {
    let url = format!("{base_url}/api/tags");
    matches!(
        client.get(url).timeout(PROBE_TIMEOUT).send().await,
        Ok(resp) if resp.status().is_success()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn reports_up_when_tags_endpoint_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        let probe = LocalProbe::new(false);
        let client = reqwest::Client::new();
        assert!(probe.is_up(&client, &server.uri()).await);
    }

    #[tokio::test]
    async fn reports_down_when_tags_endpoint_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let probe = LocalProbe::new(false);
        let client = reqwest::Client::new();
        assert!(!probe.is_up(&client, &server.uri()).await);
    }

    #[tokio::test]
    async fn reports_down_when_unreachable() {
        let probe = LocalProbe::new(false);
        let client = reqwest::Client::new();
        assert!(!probe.is_up(&client, "http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn simulate_down_short_circuits_without_network() {
        let probe = LocalProbe::new(true);
        let client = reqwest::Client::new();
        // Deliberately bogus URL — if this ever made a real call it would hang/err differently.
        assert!(!probe.is_up(&client, "http://does-not-matter.invalid").await);
    }

    #[tokio::test]
    async fn cached_result_is_reused_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .expect(1)
            .mount(&server)
            .await;

        let probe = LocalProbe::new(false);
        let client = reqwest::Client::new();
        assert!(probe.is_up(&client, &server.uri()).await);
        assert!(probe.is_up(&client, &server.uri()).await, "second call within TTL must not re-probe");
    }
}
