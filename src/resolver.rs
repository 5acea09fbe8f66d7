//! Config/Resolver view (§4.6) — turns a user-facing model string into an
//! ordered [`Candidate`] list.
//!
//! A reverse index (inner model name → owning group) is built once per config
//! generation so a bare model name resolves in O(1) regardless of how many
//! groups declare it; the per-input resolution itself is cached in a
//! `DashMap` that is thrown away wholesale on every config reload (§8
//! invariant 1 — the resolver cache is empty on first call after a reload).

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;

use crate::config::{BackendEndpoint, Config};

/// One failover slot — §3 `Candidate`. `endpoint` is `None` only for the
/// synthetic `local` candidate, whose concrete endpoint is decided at
/// dispatch time by the local-probe (§4.9), not by the resolver.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub router_name: String,
    pub endpoint: Option<BackendEndpoint>,
    pub actual_model: String,
}

/// The resolver's output for a user-facing model string — §3 `ResolvedModel`.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model_group: String,
    pub virtual_model: String,
    pub capabilities: Vec<String>,
    pub candidates: Vec<Candidate>,
}

impl ResolvedModel {
    pub fn supports_thinking(&self) -> bool {
        self.capabilities.iter().any(|c| c == "thinking")
    }
}

/// Precomputed reverse index plus a per-input-string memoization cache. Built
/// fresh from a `Config` snapshot; discarded and rebuilt wholesale on reload.
pub struct Resolver {
    config: Arc<Config>,
    /// inner model name -> owning group name. Rebuilt alongside `config`.
    reverse_index: HashMap<String, String>,
    cache: DashMap<String, Option<ResolvedModel>>,
}

impl Resolver {
    pub fn new(config: Arc<Config>) -> Self {
        let reverse_index = build_reverse_index(&config);
        Self { config, reverse_index, cache: DashMap::new() }
    }

    /// Resolve `input` to a `ResolvedModel`, memoizing the result.
    pub fn resolve(&self, input: &str) -> Option<ResolvedModel> {
        if let Some(cached) = self.cache.get(input) {
            return cached.clone();
        }
        let resolved = self.resolve_uncached(input);
        self.cache.insert(input.to_string(), resolved.clone());
        resolved
    }

    fn resolve_uncached(&self, input: &str) -> Option<ResolvedModel> {
        if let Some((group_name, inner)) = input.split_once('/') {
            if let Some(group) = self.config.models.get(group_name) {
                if group.available_models.contains_key(inner) {
                    return self.build_resolved(group_name, inner);
                }
            }
        }

        if let Some(group_name) = self.reverse_index.get(input) {
            return self.build_resolved(group_name, input);
        }

        if self.config.models.contains_key("local") {
            return self.build_resolved("local", input);
        }

        None
    }

    fn build_resolved(&self, group_name: &str, virtual_model: &str) -> Option<ResolvedModel> {
        let group = self.config.models.get(group_name)?;
        let capabilities = group
            .available_models
            .get(virtual_model)
            .map(|d| d.capabilities.clone())
            .unwrap_or_default();

        let candidates = if group_name == "local" {
            vec![Candidate {
                router_name: "local".to_string(),
                endpoint: None,
                actual_model: virtual_model.to_string(),
            }]
        } else {
            group
                .endpoints
                .iter()
                .filter_map(|endpoint| {
                    endpoint.actual_model(virtual_model).map(|actual| Candidate {
                        router_name: endpoint.router_name(),
                        endpoint: Some(endpoint.clone()),
                        actual_model: actual.to_string(),
                    })
                })
                .collect::<Vec<_>>()
        };

        if candidates.is_empty() {
            return None;
        }

        Some(ResolvedModel {
            model_group: group_name.to_string(),
            virtual_model: virtual_model.to_string(),
            capabilities,
            candidates,
        })
    }
}

/// Maps every `(virtual_model)` name across every non-local group to its
/// owning group name. Conflicts (same inner name in two groups) resolve to
/// whichever group is encountered last while iterating the config's map —
/// acceptable because the `group/inner` explicit form always disambiguates.
fn build_reverse_index(config: &Config) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for (group_name, group) in &config.models {
        for inner in group.available_models.keys() {
            index.insert(inner.clone(), group_name.clone());
        }
    }
    index
}
