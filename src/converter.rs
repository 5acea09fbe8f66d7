//! Response shape translation between the OpenAI chat-completion dialect and
//! the Ollama `/api/generate` dialect (§4.3).
//!
//! Routers backed by OpenAI-compatible upstreams always return OpenAI-shaped
//! JSON. When the inbound request came in through `/api/generate`, that shape
//! has to look like Ollama's own response before it reaches the caller —
//! callers that only speak Ollama don't know what a `choices` array is.
//!
//! Streaming responses are never translated: forwarding the upstream's own
//! framing byte-for-byte is the only option once a stream has started (§4.3
//! non-goal — no cross-framing streaming translation).

use serde_json::{json, Value};

/// Ollama doesn't report wall-clock duration for non-streamed synthetic
/// responses; this is a fixed per-token estimate (50ms) used to populate
/// `total_duration` so clients that graph it see a plausible non-zero value.
const NANOS_PER_TOKEN: u64 = 50_000_000;

/// Converts one non-streamed OpenAI chat-completion response body into the
/// shape an Ollama `/api/generate` caller expects: `{model, response, done,
/// total_duration}` — exactly those four fields, nothing more.
///
/// Returns `None` if `openai_response` doesn't look like a chat completion
/// (no `choices[0].message.content`) — callers should treat that as a decode
/// failure rather than silently emitting a half-empty Ollama response.
pub fn openai_to_ollama_generate(openai_response: &Value, model: &str) -> Option<Value> {
    let content = openai_response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?
        .to_string();

    let total_tokens = openai_response
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Some(json!({
        "model": model,
        "response": content,
        "done": true,
        "total_duration": total_tokens * NANOS_PER_TOKEN,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_basic_chat_completion_to_generate_shape() {
        let openai = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello world"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12},
        });

        let ollama = openai_to_ollama_generate(&openai, "deepseek-chat").unwrap();
        assert_eq!(
            ollama,
            json!({
                "model": "deepseek-chat",
                "response": "hello world",
                "done": true,
                "total_duration": 12 * NANOS_PER_TOKEN,
            }),
            "shape must match exactly — no extra fields"
        );
    }

    #[test]
    fn missing_choices_returns_none() {
        let openai = json!({"usage": {"total_tokens": 5}});
        assert!(openai_to_ollama_generate(&openai, "m").is_none());
    }

    #[test]
    fn missing_usage_defaults_duration_to_zero() {
        let openai = json!({"choices": [{"message": {"content": "hi"}}]});
        let ollama = openai_to_ollama_generate(&openai, "m").unwrap();
        assert_eq!(ollama["total_duration"], 0);
    }
}
