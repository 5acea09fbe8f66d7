//! Per-session request caches (§4.2).
//!
//! Two independent caches share one eviction policy: entries expire after
//! [`SESSION_TTL`], and once a session map exceeds [`MAX_SESSIONS`] the
//! entry with the lowest access count is evicted to make room (ties broken
//! by oldest insertion). This rewards sessions that are actually chatty
//! instead of oldest-first, which would evict an active but bursty session
//! in favor of one that was touched once and never returned.
//!
//! - The **tool cache** recognizes when a request's `tools` array is
//!   byte-identical to one already seen this session and reuses the
//!   compressed form instead of recompressing.
//! - The **prompt cache** elides the common prefix between the current
//!   prompt and the session's last one, so repeated system-prompt-plus-history
//!   turns don't re-send megabytes of unchanged context to routers that
//!   benchmark on raw body size.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde_json::Value;

const SESSION_TTL: Duration = Duration::from_secs(300);
const MAX_SESSIONS: usize = 100;
const MIN_COMMON_PREFIX: usize = 50;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    access_count: u64,
}

/// A bounded, TTL'd, min-access-count-evicted map. Not keyed generically on
/// purpose — both caches key on session id (a `String`), so this stays a
/// concrete helper rather than a fully generic cache type.
struct SessionMap<V> {
    entries: HashMap<String, Entry<V>>,
}

impl<V> SessionMap<V> {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn sweep_expired(&mut self) {
        self.entries.retain(|_, e| e.inserted_at.elapsed() < SESSION_TTL);
    }

    fn evict_if_full(&mut self) {
        if self.entries.len() < MAX_SESSIONS {
            return;
        }
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.access_count, e.inserted_at))
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }

    fn get(&mut self, session: &str) -> Option<&V> {
        self.sweep_expired();
        match self.entries.get_mut(session) {
            Some(e) => {
                e.access_count += 1;
                Some(&e.value)
            }
            None => None,
        }
    }

    fn insert(&mut self, session: String, value: V) {
        self.sweep_expired();
        self.evict_if_full();
        self.entries.insert(
            session,
            Entry { value, inserted_at: Instant::now(), access_count: 0 },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cached compressed form of a `tools` array, keyed within a session by the
/// hash of its canonical JSON.
struct ToolCacheEntry {
    hash: String,
    compressed: Value,
}

/// Per-session caches shared across a request's lifetime.
pub struct RequestCaches {
    tools: Mutex<SessionMap<ToolCacheEntry>>,
    prompts: Mutex<SessionMap<String>>,
}

/// Result of [`RequestCaches::compress_tools`].
pub enum ToolCompression {
    /// The tools array was already compressed for this session; reused verbatim.
    CacheHit(Value),
    /// This is the first time we've seen this exact tools array this session.
    Computed(Value),
}

impl ToolCompression {
    pub fn into_value(self) -> Value {
        match self {
            ToolCompression::CacheHit(v) | ToolCompression::Computed(v) => v,
        }
    }
}

impl RequestCaches {
    pub fn new() -> Self {
        Self { tools: Mutex::new(SessionMap::new()), prompts: Mutex::new(SessionMap::new()) }
    }

    /// Hash of the canonical (key-sorted, whitespace-free) JSON encoding of `tools`.
    fn tools_hash(tools: &Value) -> String {
        let canonical = canonicalize(tools);
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = md5::compute(&bytes);
        format!("{digest:x}")[..12].to_string()
    }

    /// Compresses `tools` for `session`, reusing a prior compression if the
    /// array is byte-identical (by canonical hash) to the last one seen.
    /// `compress` is only invoked on a cache miss.
    pub fn compress_tools(
        &self,
        session: &str,
        tools: &Value,
        compress: impl FnOnce(&Value) -> Value,
    ) -> ToolCompression {
        let hash = Self::tools_hash(tools);
        let mut cache = self.tools.lock().expect("tool cache mutex poisoned");

        if let Some(entry) = cache.get(session) {
            if entry.hash == hash {
                return ToolCompression::CacheHit(entry.compressed.clone());
            }
        }

        let compressed = compress(tools);
        cache.insert(session.to_string(), ToolCacheEntry { hash, compressed: compressed.clone() });
        ToolCompression::Computed(compressed)
    }

    /// Elides the common prefix between `prompt` and the session's benchmark,
    /// replacing it with a sentinel when the shared prefix is at least
    /// [`MIN_COMMON_PREFIX`] characters. The benchmark is left unchanged
    /// whenever elision fires — it only advances to `prompt` when the shared
    /// prefix falls short of the threshold. A `prompt` byte-identical to the
    /// benchmark is a pure no-op: the access is touched but nothing is
    /// rewritten or replaced.
    pub fn compress_prompt(&self, session: &str, prompt: &str) -> String {
        let mut cache = self.prompts.lock().expect("prompt cache mutex poisoned");

        let previous = cache.get(session).cloned();

        match previous {
            None => {
                cache.insert(session.to_string(), prompt.to_string());
                prompt.to_string()
            }
            Some(previous) if previous == prompt => prompt.to_string(),
            Some(previous) => {
                let (elided, fired) = elide_common_prefix(&previous, prompt);
                if !fired {
                    cache.insert(session.to_string(), prompt.to_string());
                }
                elided
            }
        }
    }

    #[cfg(test)]
    pub fn tool_session_count(&self) -> usize {
        self.tools.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn prompt_session_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for RequestCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorts object keys recursively so two structurally-identical JSON values
/// with reordered keys hash the same.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// If `current` shares a prefix of at least [`MIN_COMMON_PREFIX`] chars with
/// `previous`, replaces that prefix with a sentinel carrying its first and
/// last 30 characters: `<开头{head}....末尾{tail}>` followed by whatever of
/// `current` comes after the shared prefix. Operates on char boundaries, not
/// bytes, so multi-byte UTF-8 text never gets split mid-codepoint. Returns
/// whether elision actually fired, so the caller knows whether to leave the
/// benchmark untouched or advance it to `current`.
///
/// Callers must handle the byte-identical case themselves — here, `current`
/// equal to `previous` would make `common_len` span the whole string and
/// collapse it down to the bare sentinel with nothing after it.
fn elide_common_prefix(previous: &str, current: &str) -> (String, bool) {
    let common_len = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();

    if common_len < MIN_COMMON_PREFIX {
        return (current.to_string(), false);
    }

    let prefix: Vec<char> = previous.chars().take(common_len).collect();
    let head: String = prefix.iter().take(30).collect();
    let tail: String = prefix[prefix.len().saturating_sub(30)..].iter().collect();
    let rest: String = current.chars().skip(common_len).collect();
    (format!("<开头{head}....末尾{tail}>{rest}"), true)
}

/// Derives a session id for the per-session caches (§4.2) from a request
/// body: an explicit `session_id` field, else a hash of the first message's
/// content, else a fresh one-off id (requests with neither never share a
/// session, so caching degrades to a no-op for them rather than colliding).
pub fn derive_session_id(body: &Value) -> String {
    if let Some(id) = body.get("session_id").and_then(|v| v.as_str()) {
        return id.to_string();
    }

    if let Some(first) = first_message_content(body) {
        let snippet: String = first.chars().take(100).collect();
        let digest = md5::compute(snippet.as_bytes());
        let hex = format!("{digest:x}");
        return format!("session_{}", &hex[..8]);
    }

    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let rand = &uuid::Uuid::new_v4().simple().to_string()[..4];
    format!("temp_{ms}_{rand}")
}

fn first_message_content(body: &Value) -> Option<&str> {
    body.get("messages")?.as_array()?.first()?.get("content")?.as_str()
}

/// Returns the `content` of the last `role: "user"` message in an OpenAI-shaped
/// `messages` array, if any.
pub fn last_user_message_content(body: &Value) -> Option<String> {
    body.get("messages")?
        .as_array()?
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// Overwrites the `content` of the last `role: "user"` message in-place.
pub fn set_last_user_message_content(body: &mut Value, content: &str) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else { return };
    if let Some(message) = messages
        .iter_mut()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
    {
        if let Some(obj) = message.as_object_mut() {
            obj.insert("content".to_string(), Value::String(content.to_string()));
        }
    }
}

/// Compresses a `tools` array: each tool's `function.description` is
/// truncated to 100 chars, `function.name` to 50, `parameters.required` to
/// its first 5 entries with an empty `properties` object, and entries
/// sharing the same `{name, parameters}` after compression are dropped.
pub fn compress_tool_list(tools: &Value) -> Value {
    let Some(items) = tools.as_array() else { return tools.clone() };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tool in items {
        let compressed = compress_one_tool(tool);
        let signature = tool_dedup_signature(&compressed);
        if seen.insert(signature) {
            out.push(compressed);
        }
    }
    Value::Array(out)
}

/// Dedup key for a compressed tool: `{name, parameters}` only, so two tools
/// that differ solely in `type` or `description` still collapse together.
fn tool_dedup_signature(compressed: &Value) -> String {
    let name = compressed.pointer("/function/name").cloned().unwrap_or(Value::Null);
    let parameters = compressed.pointer("/function/parameters").cloned().unwrap_or(Value::Null);
    serde_json::to_string(&serde_json::json!({ "name": name, "parameters": parameters })).unwrap_or_default()
}

fn compress_one_tool(tool: &Value) -> Value {
    let mut obj = serde_json::Map::new();
    if let Some(t) = tool.get("type") {
        obj.insert("type".to_string(), t.clone());
    }

    if let Some(func) = tool.get("function") {
        let mut f = serde_json::Map::new();
        if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
            f.insert("name".to_string(), Value::String(truncate_chars(name, 50)));
        }
        if let Some(desc) = func.get("description").and_then(|v| v.as_str()) {
            f.insert("description".to_string(), Value::String(truncate_chars(desc, 100)));
        }

        let params_type = func.pointer("/parameters/type").cloned().unwrap_or_else(|| Value::String("object".to_string()));
        let required: Vec<Value> = func
            .pointer("/parameters/required")
            .and_then(|v| v.as_array())
            .map(|r| r.iter().take(5).cloned().collect())
            .unwrap_or_default();

        f.insert(
            "parameters".to_string(),
            serde_json::json!({ "type": params_type, "properties": {}, "required": required }),
        );
        obj.insert("function".to_string(), Value::Object(f));
    }

    Value::Object(obj)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_tools_array_is_a_cache_hit_on_second_call() {
        let caches = RequestCaches::new();
        let tools = json!([{"name": "search", "parameters": {}}]);

        let mut calls = 0;
        let first = caches.compress_tools("session-1", &tools, |t| {
            calls += 1;
            json!({"compressed": t})
        });
        assert!(matches!(first, ToolCompression::Computed(_)));

        let second = caches.compress_tools("session-1", &tools, |t| {
            calls += 1;
            json!({"compressed": t})
        });
        assert!(matches!(second, ToolCompression::CacheHit(_)));
        assert_eq!(calls, 1, "compress closure must not run on cache hit");
    }

    #[test]
    fn reordered_keys_still_hash_identically() {
        let caches = RequestCaches::new();
        let a = json!([{"name": "search", "parameters": {}}]);
        let b = json!([{"parameters": {}, "name": "search"}]);

        caches.compress_tools("s", &a, |t| json!({"c": t}));
        let second = caches.compress_tools("s", &b, |t| json!({"c": t}));
        assert!(matches!(second, ToolCompression::CacheHit(_)));
    }

    #[test]
    fn different_tools_array_recomputes() {
        let caches = RequestCaches::new();
        let a = json!([{"name": "search"}]);
        let b = json!([{"name": "fetch"}]);

        caches.compress_tools("s", &a, |t| json!({"c": t}));
        let second = caches.compress_tools("s", &b, |t| json!({"c": t}));
        assert!(matches!(second, ToolCompression::Computed(_)));
    }

    #[test]
    fn prompt_with_long_shared_prefix_is_elided() {
        let caches = RequestCaches::new();
        let base = "x".repeat(80) + "first turn";
        let next = "x".repeat(80) + "second turn";

        caches.compress_prompt("sess", &base);
        let elided = caches.compress_prompt("sess", &next);

        assert!(elided.contains("second turn"));
        assert!(!elided.starts_with("xxxxxxxxxx"), "long shared prefix should be elided");
        let expected_head = "x".repeat(30);
        assert_eq!(elided, format!("<开头{expected_head}....末尾{expected_head}>second turn"));
    }

    #[test]
    fn prompt_with_short_shared_prefix_is_untouched() {
        let caches = RequestCaches::new();
        caches.compress_prompt("sess", "hello there");
        let unchanged = caches.compress_prompt("sess", "hello world");
        assert_eq!(unchanged, "hello world");
    }

    #[test]
    fn benchmark_is_unchanged_after_elision_fires() {
        let caches = RequestCaches::new();
        let base = "x".repeat(80) + "first turn";
        let second = "x".repeat(80) + "second turn";
        let third = "x".repeat(80) + "third turn";

        caches.compress_prompt("sess", &base);
        caches.compress_prompt("sess", &second);
        // If the benchmark had advanced to `second`, this would still elide
        // against the shared "x"*80 prefix either way, so compare against a
        // prompt that only shares a long prefix with `base`, not `second`.
        let elided_again = caches.compress_prompt("sess", &third);

        let expected_head = "x".repeat(30);
        assert_eq!(
            elided_again,
            format!("<开头{expected_head}....末尾{expected_head}>third turn"),
            "benchmark must still be `base`, not `second`, after an elision fired"
        );
    }

    #[test]
    fn identical_content_is_a_no_op_and_returned_verbatim() {
        let caches = RequestCaches::new();
        let prompt = "x".repeat(80) + "same every time";

        caches.compress_prompt("sess", &prompt);
        let second = caches.compress_prompt("sess", &prompt);
        let third = caches.compress_prompt("sess", &prompt);

        assert_eq!(second, prompt, "byte-identical repeat must not be collapsed into the bare sentinel");
        assert_eq!(third, prompt);
    }

    #[test]
    fn first_prompt_in_a_session_is_never_elided() {
        let caches = RequestCaches::new();
        let prompt = "y".repeat(200);
        let result = caches.compress_prompt("new-session", &prompt);
        assert_eq!(result, prompt);
    }

    #[test]
    fn session_count_reflects_inserted_sessions() {
        let caches = RequestCaches::new();
        caches.compress_prompt("a", "hello");
        caches.compress_prompt("b", "world");
        assert_eq!(caches.prompt_session_count(), 2);
    }

    #[test]
    fn session_id_prefers_explicit_field() {
        let body = json!({"session_id": "explicit-123", "messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(derive_session_id(&body), "explicit-123");
    }

    #[test]
    fn session_id_falls_back_to_first_message_hash() {
        let body = json!({"messages": [{"role": "user", "content": "hello there"}]});
        let a = derive_session_id(&body);
        let b = derive_session_id(&body);
        assert_eq!(a, b, "same first message must hash to the same session id");
        assert!(a.starts_with("session_"));
    }

    #[test]
    fn session_id_falls_back_to_fresh_id_without_messages() {
        let body = json!({});
        let a = derive_session_id(&body);
        let b = derive_session_id(&body);
        assert_ne!(a, b, "requests with no identifying field never collide");
        assert!(a.starts_with("temp_"));
    }

    #[test]
    fn compress_tool_list_truncates_and_dedupes() {
        let tools = json!([
            {"type": "function", "function": {"name": "search", "description": "x".repeat(200), "parameters": {"type": "object", "required": ["a", "b", "c", "d", "e", "f"]}}},
            {"type": "function", "function": {"name": "search", "description": "x".repeat(200), "parameters": {"type": "object", "required": ["a", "b", "c", "d", "e", "f"]}}},
        ]);
        let compressed = compress_tool_list(&tools).as_array().unwrap().clone();
        assert_eq!(compressed.len(), 1, "byte-identical tools collapse to one entry");
        let required = compressed[0].pointer("/function/parameters/required").unwrap().as_array().unwrap();
        assert_eq!(required.len(), 5);
        let desc = compressed[0].pointer("/function/description").unwrap().as_str().unwrap();
        assert_eq!(desc.chars().count(), 100);
    }

    #[test]
    fn tools_differing_only_in_type_or_description_still_dedupe() {
        let tools = json!([
            {"type": "function", "function": {"name": "search", "description": "first wording", "parameters": {"type": "object", "required": ["a"]}}},
            {"type": "function", "function": {"name": "search", "description": "second, different wording", "parameters": {"type": "object", "required": ["a"]}}},
            {"function": {"name": "search", "description": "no type field at all", "parameters": {"type": "object", "required": ["a"]}}},
        ]);
        let compressed = compress_tool_list(&tools).as_array().unwrap().clone();
        assert_eq!(
            compressed.len(),
            1,
            "name+parameters match is enough to dedupe regardless of type/description"
        );
    }

    #[test]
    fn last_user_message_helpers_round_trip() {
        let mut body = json!({"messages": [
            {"role": "system", "content": "sys"},
            {"role": "user", "content": "first"},
            {"role": "assistant", "content": "reply"},
            {"role": "user", "content": "second"},
        ]});
        assert_eq!(last_user_message_content(&body).as_deref(), Some("second"));
        set_last_user_message_content(&mut body, "replaced");
        assert_eq!(body["messages"][3]["content"], "replaced");
        assert_eq!(body["messages"][1]["content"], "first", "only the last user message is rewritten");
    }
}
