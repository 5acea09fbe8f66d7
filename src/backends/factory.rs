//! Router Registry & Factory (§4.5).
//!
//! Builds the startup-time (and hot-reload-time) map from stable
//! `router_name` to a live [`BackendRouter`]. Two special entries are always
//! present regardless of what `[models.*]` declares:
//!
//! - `"local"` — bound to the configured local Ollama daemon, the landing
//!   spot for the `local` catch-all group's candidates.
//! - `"mock"` — the built-in canned-response backend, the landing spot when
//!   the local-probe (§4.9) reports the local daemon down.

use std::{collections::HashMap, sync::Arc};

use crate::{
    config::{BackendEndpoint, Config},
    pool::ClientPool,
};

use super::BackendRouter;

pub const LOCAL_ROUTER_NAME: &str = "local";
pub const MOCK_ROUTER_NAME: &str = "mock";

/// Builds one [`BackendRouter`] per configured endpoint (keyed by its stable
/// `router_name`), plus the always-present `local` and `mock` entries.
///
/// The `local` model group's own `[models.local.*_backend]` entries, if any,
/// are intentionally not registered under their own names — the resolver
/// always routes the `local` group to the single reserved `local` router
/// (§4.6), so registering them separately would create unreachable routers.
pub fn build_registry(config: &Config, pool: Arc<ClientPool>) -> HashMap<String, BackendRouter> {
    let mut registry = HashMap::new();

    for (group_name, group) in &config.models {
        if group_name == "local" {
            continue;
        }
        for endpoint in &group.endpoints {
            let name = endpoint.router_name();
            registry
                .entry(name)
                .or_insert_with(|| BackendRouter::new(endpoint.clone(), Arc::clone(&pool)));
        }
    }

    let local_endpoint = BackendEndpoint::local(&config.local_ollama.base_url);
    registry.insert(LOCAL_ROUTER_NAME.to_string(), BackendRouter::new(local_endpoint, Arc::clone(&pool)));

    let mock_endpoint = BackendEndpoint::mock();
    registry.insert(MOCK_ROUTER_NAME.to_string(), BackendRouter::new(mock_endpoint, pool));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn config_with_one_group() -> Config {
        use crate::config::{BackendType, ModelGroup};

        let endpoint = BackendEndpoint {
            base_url: "https://api.example.com".to_string(),
            api_key: None,
            timeout_ms: 5_000,
            headers: Map::new(),
            model_mapping: Map::new(),
            backend_mode: "primary_backend".to_string(),
            backend_type: BackendType::OpenAi,
            compression_enabled: false,
            model_group: "demo".to_string(),
        };
        let mut models = HashMap::new();
        models.insert(
            "demo".to_string(),
            ModelGroup {
                name: "demo".to_string(),
                endpoints: vec![endpoint],
                available_models: HashMap::new(),
                description: None,
            },
        );
        models.insert(
            "local".to_string(),
            ModelGroup { name: "local".to_string(), endpoints: vec![], available_models: HashMap::new(), description: None },
        );

        Config {
            gateway: Default::default(),
            proxy: crate::config::ProxySettings::default(),
            local_ollama: crate::config::LocalOllamaSettings::default(),
            routing: crate::config::RoutingSettings::default(),
            models,
        }
    }

    #[test]
    fn registry_always_has_local_and_mock() {
        let pool = ClientPool::new();
        let registry = build_registry(&config_with_one_group(), pool);
        assert!(registry.contains_key(LOCAL_ROUTER_NAME));
        assert!(registry.contains_key(MOCK_ROUTER_NAME));
    }

    #[test]
    fn registry_has_one_entry_per_configured_endpoint() {
        let pool = ClientPool::new();
        let registry = build_registry(&config_with_one_group(), pool);
        assert!(registry.contains_key("demo.primary_backend"));
    }
}
