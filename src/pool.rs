//! HTTP client pool (§4.1) — reqwest `Client`s are expensive to build (TLS
//! setup, connection state) and cheap to clone once built, so the pool keys
//! on the tuple that actually changes a client's behavior and hands out
//! `Arc<reqwest::Client>` for everything else.
//!
//! Entries are reference-counted by the number of live dispatch attempts
//! using them. A background health check runs against idle entries and
//! evicts ones whose upstream no longer answers, so a wedged backend doesn't
//! keep serving a client that will only ever time out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::config::BackendEndpoint;

const IDLE_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Key identifying one pooled client. Two endpoints that share a base URL,
/// API key, and compression setting get the same underlying `reqwest::Client`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    base_url: String,
    api_key: Option<String>,
    compression_enabled: bool,
}

impl PoolKey {
    fn from_endpoint(ep: &BackendEndpoint) -> Self {
        Self {
            base_url: ep.base_url.clone(),
            api_key: ep.api_key.clone(),
            compression_enabled: ep.compression_enabled,
        }
    }
}

struct PoolEntry {
    client: Arc<reqwest::Client>,
    ref_count: AtomicU64,
    last_checked: Mutex<Instant>,
}

/// Keeps at most one live `reqwest::Client` per (base_url, api_key, compression) tuple.
pub struct ClientPool {
    entries: Mutex<HashMap<PoolKey, Arc<PoolEntry>>>,
}

/// A checked-out client. Dropping it releases the pool's reference count;
/// the underlying `reqwest::Client` is unaffected since reqwest clients are
/// themselves cheap `Arc`-backed handles.
pub struct PooledClient {
    pub client: Arc<reqwest::Client>,
    key: PoolKey,
    pool: Arc<ClientPool>,
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        let key = self.key.clone();
        tokio::spawn(async move {
            pool.release(&key).await;
        });
    }
}

impl ClientPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(HashMap::new()) })
    }

    /// Returns the pooled client for `endpoint`, building one if this is the
    /// first acquire for its key. Bumps the entry's reference count; release
    /// happens automatically when the returned [`PooledClient`] is dropped.
    pub async fn acquire(
        self: &Arc<Self>,
        endpoint: &BackendEndpoint,
    ) -> Result<PooledClient, crate::error::GatewayError> {
        let key = PoolKey::from_endpoint(endpoint);
        let mut entries = self.entries.lock().await;

        let entry = match entries.get(&key) {
            Some(entry) => Arc::clone(entry),
            None => {
                let client = build_client(endpoint)?;
                let entry = Arc::new(PoolEntry {
                    client: Arc::new(client),
                    ref_count: AtomicU64::new(0),
                    last_checked: Mutex::new(Instant::now()),
                });
                entries.insert(key.clone(), Arc::clone(&entry));
                entry
            }
        };
        drop(entries);

        entry.ref_count.fetch_add(1, Ordering::SeqCst);
        self.maybe_health_check(&key, &entry, endpoint).await;

        Ok(PooledClient { client: Arc::clone(&entry.client), key, pool: Arc::clone(self) })
    }

    async fn release(&self, key: &PoolKey) {
        let entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            let prev = entry.ref_count.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0, "pool ref count underflow for {key:?}");
        }
    }

    /// If this entry hasn't been checked recently, probe it with a cheap HEAD
    /// request. A failed probe rebuilds the client from scratch so a future
    /// acquire doesn't hand out a connection to a backend that's gone away.
    async fn maybe_health_check(
        self: &Arc<Self>,
        key: &PoolKey,
        entry: &Arc<PoolEntry>,
        endpoint: &BackendEndpoint,
    ) {
        let mut last_checked = entry.last_checked.lock().await;
        if last_checked.elapsed() < IDLE_HEALTH_CHECK_INTERVAL {
            return;
        }
        *last_checked = Instant::now();
        drop(last_checked);

        let healthy = entry
            .client
            .head(&endpoint.base_url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
            .is_ok();

        if !healthy {
            tracing::warn!(base_url = %endpoint.base_url, "pooled client failed health check, rebuilding");
            if let Ok(new_client) = build_client(endpoint) {
                let mut entries = self.entries.lock().await;
                entries.insert(
                    key.clone(),
                    Arc::new(PoolEntry {
                        client: Arc::new(new_client),
                        ref_count: AtomicU64::new(0),
                        last_checked: Mutex::new(Instant::now()),
                    }),
                );
            }
        }
    }

    #[cfg(test)]
    async fn ref_count(&self, endpoint: &BackendEndpoint) -> Option<u64> {
        let key = PoolKey::from_endpoint(endpoint);
        let entries = self.entries.lock().await;
        entries.get(&key).map(|e| e.ref_count.load(Ordering::SeqCst))
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn build_client(endpoint: &BackendEndpoint) -> Result<reqwest::Client, crate::error::GatewayError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &endpoint.headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| crate::error::GatewayError::ClientInitError(e.to_string()))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| crate::error::GatewayError::ClientInitError(e.to_string()))?;
        headers.insert(name, value);
    }

    // §4.1: advertise compression support explicitly rather than relying on
    // reqwest's feature-gated `.gzip()`/`.brotli()`/`.deflate()` automatic
    // decompression (which isn't enabled in Cargo.toml, and would also strip
    // the raw bytes we stream straight through to the client unchanged).
    if endpoint.compression_enabled {
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            reqwest::header::HeaderValue::from_static("gzip, deflate, br"),
        );
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_millis(endpoint.timeout_ms))
        .build()
        .map_err(|e| crate::error::GatewayError::ClientInitError(e.to_string()))
}
