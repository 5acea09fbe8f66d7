//! Dispatch & Failover (C7, §4.7).
//!
//! Walks a resolved model's candidate list in order, rewriting the `local`
//! router name to `mock` when the local-probe (§4.9) reports the daemon down,
//! and stops at the first candidate that produces a response — a non-stream
//! success returns immediately, a stream success returns immediately and
//! failover never applies once bytes have started flowing. A candidate that
//! fails before producing anything is logged and skipped in favor of the
//! next one; if every candidate fails this way, the last error is returned.

use serde_json::Value;

use crate::{
    backends::{factory, DispatchResponse},
    config::BackendEndpoint,
    converter,
    error::GatewayError,
    state::GatewayState,
};

/// Which wire dialect the inbound request arrived in — determines whether a
/// non-stream OpenAI-shaped response needs translating before it goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Ollama,
    OpenAi,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

/// Outcome of a full dispatch attempt — the response plus bookkeeping the
/// inbound handler needs to record a traffic entry.
pub struct DispatchOutcome {
    pub response: DispatchResponse,
    pub router_name: String,
    pub model_group: String,
    pub failed_over: bool,
}

/// Resolves `model` and attempts each candidate in order until one succeeds.
pub async fn dispatch(
    state: &GatewayState,
    model: &str,
    body: Value,
    stream: bool,
    dialect: Dialect,
) -> Result<DispatchOutcome, GatewayError> {
    let resolver = state.resolver();
    let resolved = resolver
        .resolve(model)
        .ok_or_else(|| GatewayError::NotFound(format!("model `{model}` does not resolve to any backend")))?;

    let registry = state.registry();
    let support_thinking = resolved.supports_thinking();

    let mut last_error: Option<GatewayError> = None;
    let mut failed_over = false;

    for candidate in &resolved.candidates {
        let router_name = if candidate.router_name == factory::LOCAL_ROUTER_NAME {
            let local_base_url = state.config().local_ollama.base_url.clone();
            let probe_endpoint = BackendEndpoint::local(&local_base_url);
            let up = match state.pool.acquire(&probe_endpoint).await {
                Ok(pooled) => state.local_probe.is_up(&pooled.client, &local_base_url).await,
                Err(_) => false,
            };
            if up {
                candidate.router_name.clone()
            } else {
                tracing::debug!("local daemon reported down, routing to mock instead");
                factory::MOCK_ROUTER_NAME.to_string()
            }
        } else {
            candidate.router_name.clone()
        };

        let Some(router) = registry.get(&router_name) else {
            tracing::warn!(router_name, "resolved candidate has no registered router, skipping");
            last_error = Some(GatewayError::Internal(format!("router `{router_name}` not registered")));
            failed_over = true;
            continue;
        };

        let mut attempt_body = body.clone();
        if let Some(obj) = attempt_body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(candidate.actual_model.clone()));
        }

        match router.dispatch(attempt_body, stream, support_thinking).await {
            Ok(DispatchResponse::Once(mut value)) => {
                if dialect == Dialect::Ollama && router.endpoint().backend_type == crate::config::BackendType::OpenAi {
                    if let Some(translated) = converter::openai_to_ollama_generate(&value, &resolved.virtual_model) {
                        value = translated;
                    }
                }
                return Ok(DispatchOutcome {
                    response: DispatchResponse::Once(value),
                    router_name,
                    model_group: resolved.model_group.clone(),
                    failed_over,
                });
            }
            Ok(stream_response @ DispatchResponse::Stream(..)) => {
                return Ok(DispatchOutcome {
                    response: stream_response,
                    router_name,
                    model_group: resolved.model_group.clone(),
                    failed_over,
                });
            }
            Err(err) => {
                tracing::warn!(router_name, error = %err, "candidate failed before producing a response, trying next");
                last_error = Some(err);
                failed_over = true;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| GatewayError::NotFound(format!("no reachable backend for `{model}`"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendType, Config, GatewaySettings, LocalOllamaSettings, ModelDetails, ModelGroup, ProxySettings, RoutingSettings};
    use serde_json::json;
    use std::{collections::HashMap, sync::Arc};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn endpoint(group: &str, mode: &str, url: &str, backend_type: BackendType) -> BackendEndpoint {
        BackendEndpoint {
            base_url: url.to_string(),
            api_key: None,
            timeout_ms: 5_000,
            headers: HashMap::new(),
            model_mapping: HashMap::new(),
            backend_mode: mode.to_string(),
            backend_type,
            compression_enabled: false,
            model_group: group.to_string(),
        }
    }

    fn config_with_endpoints(endpoints: Vec<BackendEndpoint>) -> Config {
        let mut available = HashMap::new();
        available.insert(
            "chat".to_string(),
            ModelDetails { context_length: None, embedding_length: None, capabilities: vec![], actual_model: "chat".to_string() },
        );
        let group = ModelGroup { name: "demo".to_string(), endpoints, available_models: available, description: None };
        let mut models = HashMap::new();
        models.insert("demo".to_string(), group);
        models.insert(
            "local".to_string(),
            ModelGroup { name: "local".to_string(), endpoints: vec![], available_models: HashMap::new(), description: None },
        );

        Config {
            gateway: GatewaySettings::default(),
            proxy: ProxySettings::default(),
            local_ollama: LocalOllamaSettings { base_url: "http://127.0.0.1:1".to_string(), simulate_down: true },
            routing: RoutingSettings::default(),
            models,
        }
    }

    fn state_with_config(config: Config) -> GatewayState {
        GatewayState::new(config, std::path::PathBuf::from("unused.toml"), Arc::new(crate::traffic::TrafficLog::new(10)))
    }

    #[tokio::test]
    async fn failover_tries_candidates_in_order_and_stops_at_first_success() {
        let failing_a = MockServer::start().await;
        let failing_b = MockServer::start().await;
        let succeeding = MockServer::start().await;

        Mock::given(method("POST")).and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing_a).await;
        Mock::given(method("POST")).and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing_b).await;
        Mock::given(method("POST")).and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "third backend answered"}}],
            })))
            .mount(&succeeding).await;

        let config = config_with_endpoints(vec![
            endpoint("demo", "a_backend", &failing_a.uri(), BackendType::OpenAi),
            endpoint("demo", "b_backend", &failing_b.uri(), BackendType::OpenAi),
            endpoint("demo", "c_backend", &succeeding.uri(), BackendType::OpenAi),
        ]);
        let state = state_with_config(config);

        let body = json!({"model": "chat", "messages": [{"role": "user", "content": "hi"}]});
        let outcome = dispatch(&state, "chat", body, false, Dialect::OpenAi).await.unwrap();
        assert_eq!(outcome.router_name, "demo.c_backend");
        assert!(outcome.failed_over);
        match outcome.response {
            DispatchResponse::Once(v) => assert_eq!(v["choices"][0]["message"]["content"], "third backend answered"),
            _ => panic!("expected Once"),
        }
    }

    #[tokio::test]
    async fn all_candidates_failing_returns_last_error() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        Mock::given(method("POST")).and(path("/chat/completions")).respond_with(ResponseTemplate::new(500)).mount(&a).await;
        Mock::given(method("POST")).and(path("/chat/completions")).respond_with(ResponseTemplate::new(503)).mount(&b).await;

        let config = config_with_endpoints(vec![
            endpoint("demo", "a_backend", &a.uri(), BackendType::OpenAi),
            endpoint("demo", "b_backend", &b.uri(), BackendType::OpenAi),
        ]);
        let state = state_with_config(config);

        let body = json!({"model": "chat", "messages": []});
        let err = dispatch(&state, "chat", body, false, Dialect::OpenAi).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamError { status: 503, .. }));
    }

    #[tokio::test]
    async fn unresolvable_model_is_not_found() {
        let config = config_with_endpoints(vec![]);
        let mut config = config;
        config.models.remove("local");
        let state = state_with_config(config);
        let err = dispatch(&state, "nonexistent", json!({}), false, Dialect::OpenAi).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn ollama_dialect_translates_openai_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "translated"}}],
                "usage": {"total_tokens": 2},
            })))
            .mount(&server).await;

        let config = config_with_endpoints(vec![endpoint("demo", "a_backend", &server.uri(), BackendType::OpenAi)]);
        let state = state_with_config(config);

        let body = json!({"model": "chat", "messages": [{"role": "user", "content": "hi"}]});
        let outcome = dispatch(&state, "chat", body, false, Dialect::Ollama).await.unwrap();
        match outcome.response {
            DispatchResponse::Once(v) => {
                assert_eq!(v["response"], "translated");
                assert_eq!(v["done"], true);
            }
            _ => panic!("expected Once"),
        }
    }

    #[tokio::test]
    async fn local_group_falls_back_to_mock_when_probe_reports_down() {
        let config = config_with_endpoints(vec![]);
        let state = state_with_config(config);

        let body = json!({"model": "llama3", "prompt": "hello"});
        let outcome = dispatch(&state, "llama3", body, false, Dialect::Ollama).await.unwrap();
        assert_eq!(outcome.router_name, "mock");
    }
}
