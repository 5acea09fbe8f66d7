//! Backend router factory and the shared streaming primitive (§4.4 / §4.5).
//!
//! A [`BackendRouter`] is a live, constructed handle to one upstream endpoint —
//! built once at startup (or on hot-reload) from a [`BackendEndpoint`] and kept
//! in the [`registry`] by its stable `router_name`. All three driver variants
//! share one streaming primitive ([`meter_stream`]) so TTFB/chunk/byte metering
//! and mid-stream error framing behave identically regardless of which
//! upstream dialect is being spoken.

pub mod factory;
mod mock;
mod ollama;
mod openai;

pub use mock::MockRouter;
pub use ollama::OllamaRouter;
pub use openai::OpenAiRouter;

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::{cache, config::BackendEndpoint, error::GatewayError, pool::ClientPool};

/// A `Send`-able byte stream already framed for the caller's dialect. Errors
/// observed mid-stream are never propagated as `Err` — [`meter_stream`] turns
/// them into one last framed chunk and ends the stream cleanly, since an SSE
/// or NDJSON client has no way to represent "the HTTP stream itself broke"
/// other than a chunk that says so.
pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Outcome of one dispatch attempt against a single backend.
pub enum DispatchResponse {
    /// A complete, parsed JSON response (non-streamed request).
    Once(Value),
    /// A live byte stream (streamed request). Carries the shared metrics
    /// handle so the caller can read final counts after the stream ends.
    Stream(ByteStream, Arc<Mutex<StreamMetrics>>),
}

/// Timing and volume counters for one streamed dispatch attempt, recorded
/// into the traffic log once the stream completes or the connection drops.
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub ttfb: Option<Duration>,
    pub chunk_count: u64,
    pub byte_count: u64,
    pub ended_with_error: bool,
}

/// One live upstream target, dispatched to via the driver appropriate to its
/// [`crate::config::BackendType`].
pub enum BackendRouter {
    OpenAi(OpenAiRouter),
    Ollama(OllamaRouter),
    Mock(MockRouter),
}

impl BackendRouter {
    pub fn new(endpoint: BackendEndpoint, pool: Arc<ClientPool>) -> Self {
        use crate::config::BackendType;
        match endpoint.backend_type {
            BackendType::OpenAi => Self::OpenAi(OpenAiRouter::new(endpoint, pool)),
            BackendType::Ollama => Self::Ollama(OllamaRouter::new(endpoint, pool)),
            BackendType::Mock => Self::Mock(MockRouter::new(endpoint)),
        }
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        match self {
            Self::OpenAi(r) => &r.endpoint,
            Self::Ollama(r) => &r.endpoint,
            Self::Mock(r) => &r.endpoint,
        }
    }

    pub fn router_name(&self) -> String {
        self.endpoint().router_name()
    }

    /// Forwards `request` to the upstream and returns either a parsed
    /// response or a live stream. `support_thinking` reflects the resolved
    /// virtual model's `thinking` capability tag (§4.4.1); only the OpenAI
    /// driver acts on it.
    pub async fn dispatch(
        &self,
        request: Value,
        stream: bool,
        support_thinking: bool,
    ) -> Result<DispatchResponse, GatewayError> {
        match self {
            Self::OpenAi(r) => r.dispatch(request, stream, support_thinking).await,
            Self::Ollama(r) => r.dispatch(request, stream).await,
            Self::Mock(r) => r.dispatch(request, stream).await,
        }
    }

    pub async fn health_check(&self) -> Result<(), GatewayError> {
        match self {
            Self::OpenAi(r) => r.health_check().await,
            Self::Ollama(r) => r.health_check().await,
            Self::Mock(_) => Ok(()),
        }
    }
}

/// Wraps a raw `reqwest` byte stream with TTFB/chunk/byte metering and
/// mid-stream error framing.
///
/// On the first successful item, records time-to-first-byte. On an `Err`
/// from the underlying stream, emits one final frame built by `frame_error`
/// (an NDJSON line or SSE `data:` block depending on the caller's dialect)
/// and then ends — there is no mid-stream retry (§4.4 non-goal).
pub fn meter_stream(
    inner: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    frame_error: impl Fn(&str) -> Bytes + Send + 'static,
) -> (ByteStream, Arc<Mutex<StreamMetrics>>) {
    let metrics = Arc::new(Mutex::new(StreamMetrics::default()));
    let metrics_for_stream = Arc::clone(&metrics);
    let start = Instant::now();

    let stream = async_stream::stream! {
        futures_util::pin_mut!(inner);
        while let Some(item) = inner.next().await {
            match item {
                Ok(bytes) => {
                    let mut m = metrics_for_stream.lock().expect("stream metrics mutex poisoned");
                    if m.ttfb.is_none() {
                        m.ttfb = Some(start.elapsed());
                    }
                    m.chunk_count += 1;
                    m.byte_count += bytes.len() as u64;
                    drop(m);
                    yield bytes;
                }
                Err(e) => {
                    let mut m = metrics_for_stream.lock().expect("stream metrics mutex poisoned");
                    m.ended_with_error = true;
                    drop(m);
                    tracing::warn!(error = %e, "mid-stream transport error, emitting framed error chunk");
                    yield frame_error(&e.to_string());
                    break;
                }
            }
        }
    };

    (Box::pin(stream), metrics)
}

/// SSE-dialect error frame: one `data:` block carrying a JSON error object.
pub fn sse_error_frame(message: &str) -> Bytes {
    let payload = json!({ "error": { "message": message, "type": "mid_stream_error" } });
    Bytes::from(format!("data: {payload}\n\n"))
}

/// NDJSON-dialect error frame: one line, `done: true` so NDJSON readers stop
/// expecting more lines.
pub fn ndjson_error_frame(message: &str) -> Bytes {
    let payload = json!({ "error": message, "done": true });
    Bytes::from(format!("{payload}\n"))
}

/// Reads a full (non-streamed) JSON body from an upstream response, mapping
/// non-2xx statuses and decode failures to the right [`GatewayError`] variant.
pub(crate) async fn read_json_response(response: reqwest::Response) -> Result<Value, GatewayError> {
    let status = response.status();
    let text = response.text().await.map_err(|e| GatewayError::TransportError(e.to_string()))?;

    if !status.is_success() {
        return Err(GatewayError::upstream(status.as_u16(), text));
    }

    serde_json::from_str(&text).map_err(|e| GatewayError::DecodeError(e.to_string()))
}

/// Applies the C2 tool-dedup and prompt-elision caches to `request` in place,
/// under the session id derived from the request itself. Shared by the
/// OpenAI and Ollama drivers — the mock driver skips it since it never
/// inspects the request body.
pub(crate) fn apply_request_caches(caches: &cache::RequestCaches, session: &str, request: &mut Value) {
    if let Some(tools) = request.get("tools").cloned() {
        if !tools.is_null() {
            let compressed = caches.compress_tools(session, &tools, cache::compress_tool_list).into_value();
            if let Some(obj) = request.as_object_mut() {
                obj.insert("tools".to_string(), compressed);
            }
        }
    }

    if let Some(prompt) = cache::last_user_message_content(request) {
        let elided = caches.compress_prompt(session, &prompt);
        cache::set_last_user_message_content(request, &elided);
    }
}

/// POSTs `body` to `url` and renders the response per `stream` (§4.4.2/4.4.4
/// common path shared by the Ollama and OpenAI drivers).
///
/// For a streamed request, a non-2xx upstream status is *not* a dispatch
/// failure — the HTTP response (and therefore the decision to stream) has
/// already been committed, so the error is instead framed as a single chunk
/// by `frame_error` and handed back as a one-chunk `DispatchResponse::Stream`.
/// This keeps failover (which only applies before any bytes are produced)
/// from ever racing a half-open stream.
pub(crate) async fn post_and_respond(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    stream: bool,
    frame_error: impl Fn(&str) -> Bytes + Send + 'static,
) -> Result<DispatchResponse, GatewayError> {
    let response = client.post(url).json(body).send().await?;

    if !stream {
        return read_json_response(response).await.map(DispatchResponse::Once);
    }

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let frame = frame_error(&format!("upstream {status}: {text}"));
        let metrics = Arc::new(Mutex::new(StreamMetrics {
            ttfb: Some(Duration::ZERO),
            chunk_count: 1,
            byte_count: frame.len() as u64,
            ended_with_error: true,
        }));
        let one: ByteStream = Box::pin(futures_util::stream::once(async move { frame }));
        return Ok(DispatchResponse::Stream(one, metrics));
    }

    let (s, metrics) = meter_stream(response.bytes_stream(), frame_error);
    Ok(DispatchResponse::Stream(s, metrics))
}
