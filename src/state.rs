//! Shared application state injected into every request handler via
//! [`axum::extract::State`].
//!
//! Config, the router registry, and the resolver all move together: a
//! hot-reload rebuilds all three behind one lock swap apiece so a request
//! in flight never observes a resolver built from one config generation
//! paired with a registry built from another.

use std::{collections::HashMap, path::PathBuf, sync::Arc, sync::RwLock, time::Instant};

use crate::{
    backends::{factory, BackendRouter},
    config::Config,
    local_probe::LocalProbe,
    pool::ClientPool,
    resolver::Resolver,
    traffic::TrafficLog,
};

pub struct GatewayState {
    config: RwLock<Arc<Config>>,
    registry: RwLock<Arc<HashMap<String, BackendRouter>>>,
    resolver: RwLock<Arc<Resolver>>,
    /// Path to the config file on disk — used by the hot-reload background task.
    pub config_path: PathBuf,
    pub pool: Arc<ClientPool>,
    pub local_probe: LocalProbe,
    /// In-memory ring-buffer of recent requests, exposed through the admin API.
    pub traffic: Arc<TrafficLog>,
    /// Gateway start time — used to compute uptime for the public status endpoint.
    pub started_at: Instant,
    /// Bearer token required for admin API access. `None` disables admin auth
    /// (the admin port should then be firewalled).
    pub admin_token: Option<String>,
}

impl GatewayState {
    pub fn new(config: Config, config_path: PathBuf, traffic: Arc<TrafficLog>) -> Self {
        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());

        let pool = ClientPool::new();
        let local_probe = LocalProbe::new(config.local_ollama.simulate_down);

        let config = Arc::new(config);
        let registry = Arc::new(factory::build_registry(&config, Arc::clone(&pool)));
        let resolver = Arc::new(Resolver::new(Arc::clone(&config)));

        Self {
            config: RwLock::new(config),
            registry: RwLock::new(registry),
            resolver: RwLock::new(resolver),
            config_path,
            pool,
            local_probe,
            traffic,
            started_at: Instant::now(),
            admin_token,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    pub fn registry(&self) -> Arc<HashMap<String, BackendRouter>> {
        Arc::clone(&self.registry.read().expect("registry lock poisoned"))
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver.read().expect("resolver lock poisoned"))
    }

    /// Swaps in a freshly loaded config, rebuilding the registry and resolver
    /// to match. Called by the hot-reload watcher; never called mid-request.
    pub fn replace_config(&self, new_config: Config) {
        let new_config = Arc::new(new_config);
        let new_registry = Arc::new(factory::build_registry(&new_config, Arc::clone(&self.pool)));
        let new_resolver = Arc::new(Resolver::new(Arc::clone(&new_config)));

        *self.config.write().expect("config lock poisoned") = new_config;
        *self.registry.write().expect("registry lock poisoned") = new_registry;
        *self.resolver.write().expect("resolver lock poisoned") = new_resolver;
    }
}
