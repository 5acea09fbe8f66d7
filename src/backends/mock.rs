//! Built-in mock backend (§4.4.3) — canned responses, no network I/O.
//!
//! Always registered so the local-probe-down fallback (§4.9) has somewhere
//! to land, and usable directly as any virtual model's upstream for demos
//! and tests. Paces streamed output at one word per 50ms so clients that
//! render tokens as they arrive see the same cadence they'd see from a real
//! streaming backend.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde_json::{json, Value};

use crate::{config::BackendEndpoint, error::GatewayError};

use super::{ByteStream, DispatchResponse, StreamMetrics};

const WORD_INTERVAL: Duration = Duration::from_millis(50);
const CANNED_RESPONSE: &str = "This is a mocked response from the built-in mock backend.";

pub struct MockRouter {
    pub endpoint: BackendEndpoint,
}

impl MockRouter {
    pub fn new(endpoint: BackendEndpoint) -> Self {
        Self { endpoint }
    }

    pub async fn dispatch(&self, request: Value, stream: bool) -> Result<DispatchResponse, GatewayError> {
        let model = request.get("model").and_then(|v| v.as_str()).unwrap_or("mock").to_string();
        let is_chat_shape = request.get("messages").is_some();

        if !stream {
            return Ok(DispatchResponse::Once(once_body(is_chat_shape, &model)));
        }

        let metrics = Arc::new(Mutex::new(StreamMetrics::default()));
        let metrics_for_stream = Arc::clone(&metrics);

        let stream: ByteStream = Box::pin(async_stream::stream! {
            let start = Instant::now();
            let words: Vec<&str> = CANNED_RESPONSE.split_whitespace().collect();
            let total = words.len();

            for (i, word) in words.iter().enumerate() {
                tokio::time::sleep(WORD_INTERVAL).await;
                let done = i + 1 == total;
                let chunk = if is_chat_shape {
                    chat_chunk(&model, word, done)
                } else {
                    generate_chunk(&model, word, done)
                };

                {
                    let mut m = metrics_for_stream.lock().expect("mock stream metrics mutex poisoned");
                    if m.ttfb.is_none() {
                        m.ttfb = Some(start.elapsed());
                    }
                    m.chunk_count += 1;
                    m.byte_count += chunk.len() as u64;
                }
                yield chunk;
            }

            if is_chat_shape {
                yield Bytes::from_static(b"data: [DONE]\n\n");
            }
        });

        Ok(DispatchResponse::Stream(stream, metrics))
    }

    pub async fn health_check(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

fn once_body(is_chat_shape: bool, model: &str) -> Value {
    if is_chat_shape {
        json!({
            "id": format!("chatcmpl-mock-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": CANNED_RESPONSE},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": CANNED_RESPONSE.split_whitespace().count(), "total_tokens": CANNED_RESPONSE.split_whitespace().count()},
        })
    } else {
        json!({
            "model": model,
            "response": CANNED_RESPONSE,
            "done": true,
            "total_duration": 0,
        })
    }
}

fn chat_chunk(model: &str, word: &str, done: bool) -> Bytes {
    let delta = if done { json!({}) } else { json!({"role": "assistant", "content": format!("{word} ")}) };
    let payload = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": if done { json!("stop") } else { Value::Null }}],
    });
    Bytes::from(format!("data: {payload}\n\n"))
}

fn generate_chunk(model: &str, word: &str, done: bool) -> Bytes {
    let payload = json!({
        "model": model,
        "response": format!("{word} "),
        "done": done,
    });
    Bytes::from(format!("{payload}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn endpoint() -> BackendEndpoint {
        BackendEndpoint::mock()
    }

    #[tokio::test]
    async fn non_stream_generate_shape_has_exact_four_fields() {
        let router = MockRouter::new(endpoint());
        let request = json!({"model": "anything", "prompt": "hi"});
        match router.dispatch(request, false).await.unwrap() {
            DispatchResponse::Once(body) => {
                assert_eq!(body["done"], true);
                assert!(body["response"].as_str().unwrap().contains("mocked"));
            }
            _ => panic!("expected Once"),
        }
    }

    #[tokio::test]
    async fn non_stream_chat_shape_returns_chat_completion() {
        let router = MockRouter::new(endpoint());
        let request = json!({"model": "anything", "messages": [{"role": "user", "content": "hi"}]});
        match router.dispatch(request, false).await.unwrap() {
            DispatchResponse::Once(body) => {
                assert_eq!(body["object"], "chat.completion");
                assert!(body["choices"][0]["message"]["content"].as_str().unwrap().contains("mocked"));
            }
            _ => panic!("expected Once"),
        }
    }

    #[tokio::test]
    async fn stream_generate_shape_ends_with_done_true() {
        let router = MockRouter::new(endpoint());
        let request = json!({"model": "anything", "prompt": "hi"});
        match router.dispatch(request, true).await.unwrap() {
            DispatchResponse::Stream(mut s, metrics) => {
                let mut last = Bytes::new();
                while let Some(chunk) = s.next().await {
                    last = chunk;
                }
                let text = String::from_utf8(last.to_vec()).unwrap();
                assert!(text.contains("\"done\":true"));
                assert!(metrics.lock().unwrap().chunk_count > 1);
            }
            _ => panic!("expected Stream"),
        }
    }
}
