//! Configuration types for the gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. A sibling `*.local.toml` overlay (if present next
//! to the base file) is deep-merged on top — handy for machine-local API keys
//! that should never land in version control. Invalid configs are rejected
//! with a clear error rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [proxy]
//! tool_compression_enabled = true
//!
//! [local_ollama]
//! base_url = "http://localhost:11434"
//!
//! [models.deepseek]
//! description = "DeepSeek chat models"
//!
//! [models.deepseek.available_models.deepseek-chat]
//! actual_model = "deepseek-chat"
//!
//! [models.deepseek.primary_backend]
//! base_url = "https://api.deepseek.com/v1"
//! api_key = "your-deepseek-key"
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Driver tag selecting which [`crate::backends::BackendRouter`] variant
/// handles a given endpoint. Derived from `backend_type`/`backend_mode`/
/// `base_url` by [`BackendEndpoint::backend_type`] — see the factory rules
/// in `backends::factory`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    OpenAi,
    Ollama,
    Mock,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        })
    }
}

/// Per-virtual-model metadata attached in `[models.<group>.available_models.<name>]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub embedding_length: Option<u64>,
    /// Capability tags, e.g. `["thinking", "tools"]`. Presence of `"thinking"`
    /// drives `support_thinking` at dispatch time.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// The model name actually sent to the upstream backend.
    pub actual_model: String,
}

impl ModelDetails {
    pub fn supports_thinking(&self) -> bool {
        self.capabilities.iter().any(|c| c == "thinking")
    }
}

/// One upstream backend entry as it appears in the TOML document, before the
/// owning [`ModelGroup`] name and insertion order are attached.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntryConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Timeout in milliseconds. Defaults to 30s.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    /// Extra static headers merged under the derived ones.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Renames inner virtual-model names to upstream-specific names, when the
    /// upstream doesn't take `actual_model` from `available_models` verbatim.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Explicit driver override. When absent, derived from `backend_mode` / `base_url`.
    #[serde(default)]
    pub backend_type: Option<String>,
    #[serde(default)]
    pub compression_enabled: bool,
}

/// A fully resolved upstream target — §3 `BackendEndpoint`.
///
/// Immutable after construction. `model_group` is a back-reference to the
/// owning [`ModelGroup`]'s name, used for router naming and diagnostics.
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub headers: HashMap<String, String>,
    pub model_mapping: HashMap<String, String>,
    /// The raw `<foo>_backend` key this endpoint was declared under, e.g. `primary_backend`.
    pub backend_mode: String,
    pub backend_type: BackendType,
    pub compression_enabled: bool,
    pub model_group: String,
}

impl BackendEndpoint {
    fn from_config(
        group: &str,
        backend_mode: &str,
        cfg: &BackendEntryConfig,
        default_backend_mode: &str,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!cfg.base_url.is_empty(), "backend `{backend_mode}` in group `{group}` has an empty base_url");
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        anyhow::ensure!(
            base_url.contains("://"),
            "backend `{backend_mode}` in group `{group}` base_url `{base_url}` must include a scheme"
        );

        if let Some(key) = &cfg.api_key {
            if key.contains("your-") || key.contains("***") {
                tracing::warn!(
                    group, backend_mode, "api_key looks like a placeholder sentinel — endpoint will still be used"
                );
            }
        }

        let backend_type = resolve_backend_type(cfg, &base_url, backend_mode, default_backend_mode);

        let mut headers = cfg.headers.clone();
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        if let Some(key) = &cfg.api_key {
            if base_url.contains("anthropic.com") {
                headers.insert("x-api-key".to_string(), key.clone());
            } else {
                headers.insert("Authorization".to_string(), format!("Bearer {key}"));
            }
        }

        Ok(Self {
            base_url,
            api_key: cfg.api_key.clone(),
            timeout_ms: cfg.timeout_ms,
            headers,
            model_mapping: cfg.model_mapping.clone(),
            backend_mode: backend_mode.to_string(),
            backend_type,
            compression_enabled: cfg.compression_enabled,
            model_group: group.to_string(),
        })
    }

    /// The upstream model name for a given virtual/inner model name, applying
    /// `model_mapping` if present.
    pub fn actual_model<'a>(&'a self, inner: &'a str) -> Option<&'a str> {
        Some(self.model_mapping.get(inner).map(|s| s.as_str()).unwrap_or(inner))
    }

    /// Stable router name assigned at startup: `"{model_group}.{backend_mode}"`.
    pub fn router_name(&self) -> String {
        format!("{}.{}", self.model_group, self.backend_mode)
    }

    /// Dedup key for the router registry (C5) — two endpoints sharing this key
    /// are served by the same router/pool entry.
    pub fn dedup_key(&self) -> (String, Option<String>, String) {
        (self.base_url.clone(), self.api_key.clone(), self.backend_mode.clone())
    }

    /// Synthetic endpoint for the always-registered `local` router, bound to
    /// the configured local Ollama daemon rather than a `[models.*]` entry.
    pub fn local(base_url: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            timeout_ms: defaults::timeout_ms(),
            headers,
            model_mapping: HashMap::new(),
            backend_mode: "local_backend".to_string(),
            backend_type: BackendType::Ollama,
            compression_enabled: false,
            model_group: "local".to_string(),
        }
    }

    /// Synthetic endpoint for the always-registered `mock` router. Carries no
    /// reachable `base_url` since [`crate::backends::MockRouter`] never makes
    /// a network call.
    pub fn mock() -> Self {
        Self {
            base_url: "mock://local".to_string(),
            api_key: None,
            timeout_ms: defaults::timeout_ms(),
            headers: HashMap::new(),
            model_mapping: HashMap::new(),
            backend_mode: "mock_backend".to_string(),
            backend_type: BackendType::Mock,
            compression_enabled: false,
            model_group: "mock".to_string(),
        }
    }
}

/// Alias table for `backend_type` overrides (§4.5 rule 1).
fn normalize_backend_type_alias(raw: &str) -> &str {
    match raw {
        "http" | "openai_compat" | "openai_sdk" => "openai",
        other => other,
    }
}

const KNOWN_OPENAI_VENDOR_HOSTS: &[&str] =
    &["api.openai.com", "api.deepseek.com", "api.anthropic.com", "openrouter.ai"];

fn resolve_backend_type(
    cfg: &BackendEntryConfig,
    base_url: &str,
    backend_mode: &str,
    default_backend_mode: &str,
) -> BackendType {
    if let Some(explicit) = &cfg.backend_type {
        return match normalize_backend_type_alias(explicit) {
            "ollama" => BackendType::Ollama,
            "mock" => BackendType::Mock,
            _ => BackendType::OpenAi,
        };
    }

    let mode = if backend_mode.is_empty() { default_backend_mode } else { backend_mode };
    if mode.starts_with("openai_backend") || mode == "openai_backend" {
        return BackendType::OpenAi;
    }
    if mode.starts_with("litellm_backend") {
        return BackendType::OpenAi;
    }
    if mode.starts_with("ollama_backend") {
        return BackendType::Ollama;
    }
    if mode.starts_with("mock_backend") {
        return BackendType::Mock;
    }

    if KNOWN_OPENAI_VENDOR_HOSTS.iter().any(|h| base_url.contains(h)) {
        return BackendType::OpenAi;
    }
    if base_url.contains("localhost") || base_url.contains("127.0.0.1") {
        return BackendType::Ollama;
    }

    BackendType::OpenAi
}

/// A named bucket of virtual models sharing one or more upstream endpoints — §3 `ModelGroup`.
#[derive(Debug, Clone)]
pub struct ModelGroup {
    pub name: String,
    /// Insertion order is the failover order.
    pub endpoints: Vec<BackendEndpoint>,
    pub available_models: HashMap<String, ModelDetails>,
    pub description: Option<String>,
}

/// Raw TOML shape for one `[models.<group>]` table. Backend entries are any
/// key ending in `_backend`; everything else is a fixed field.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ModelGroupConfig {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub available_models: HashMap<String, ModelDetails>,
    /// `_backend`-suffixed keys are endpoints. `IndexMap` (not `HashMap`) so
    /// declaration order survives `#[serde(flatten)]` — insertion order is the
    /// failover order (§3 `ModelGroup`), and a plain `HashMap` here would
    /// silently scramble it regardless of the `toml` crate's `preserve_order`.
    #[serde(flatten)]
    pub backends: indexmap::IndexMap<String, toml::Value>,
}

impl ModelGroupConfig {
    fn build(self, name: &str, default_backend_mode: &str) -> anyhow::Result<ModelGroup> {
        let backend_keys: Vec<&String> = self.backends.keys().filter(|k| k.ends_with("_backend")).collect();

        let mut endpoints = Vec::with_capacity(backend_keys.len());
        for key in backend_keys {
            let raw = &self.backends[key];
            let entry: BackendEntryConfig = raw
                .clone()
                .try_into()
                .with_context(|| format!("parsing backend `{key}` in group `{name}`"))?;
            endpoints.push(BackendEndpoint::from_config(name, key, &entry, default_backend_mode)?);
        }

        anyhow::ensure!(
            !self.available_models.is_empty() || name == "local",
            "model group `{name}` has no available_models (only the `local` group may be empty)"
        );

        Ok(ModelGroup {
            name: name.to_string(),
            endpoints,
            available_models: self.available_models,
            description: self.description,
        })
    }
}

/// `[proxy]` — global feature toggles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub verbose_json_logging: bool,
    #[serde(default = "defaults::bool_true")]
    pub tool_compression_enabled: bool,
    #[serde(default = "defaults::bool_true")]
    pub prompt_compression_enabled: bool,
    #[serde(default)]
    pub http_compression_enabled: bool,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            verbose_json_logging: false,
            tool_compression_enabled: true,
            prompt_compression_enabled: true,
            http_compression_enabled: false,
            log_level: None,
        }
    }
}

/// `[local_ollama]` — the local daemon this gateway also fronts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalOllamaSettings {
    #[serde(default = "defaults::local_ollama_base_url")]
    pub base_url: String,
    /// Forces the local-probe (C9) to always report "down" — useful for demos/tests.
    #[serde(default)]
    pub simulate_down: bool,
}

impl Default for LocalOllamaSettings {
    fn default() -> Self {
        Self {
            base_url: defaults::local_ollama_base_url(),
            simulate_down: false,
        }
    }
}

/// `[routing]` — cross-cutting routing defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingSettings {
    #[serde(default = "defaults::default_backend_mode")]
    pub default_backend_mode: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self { default_backend_mode: defaults::default_backend_mode() }
    }
}

/// `[gateway]` — server/ops settings, ambient to the core per SPEC_FULL §4.10.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,
    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication.
    #[serde(default)]
    pub admin_token_env: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            admin_token_env: None,
        }
    }
}

/// Raw TOML document shape, deserialized before the `models` map is turned
/// into [`ModelGroup`]s with env-var overrides applied.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct RawConfig {
    #[serde(default)]
    gateway: GatewaySettings,
    #[serde(default)]
    proxy: ProxySettings,
    #[serde(default)]
    local_ollama: LocalOllamaSettings,
    #[serde(default)]
    routing: RoutingSettings,
    #[serde(default)]
    models: HashMap<String, ModelGroupConfig>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            proxy: ProxySettings::default(),
            local_ollama: LocalOllamaSettings::default(),
            routing: RoutingSettings::default(),
            models: HashMap::new(),
        }
    }
}

/// Top-level, fully-resolved gateway configuration — §3 `GatewayConfig`.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewaySettings,
    pub proxy: ProxySettings,
    pub local_ollama: LocalOllamaSettings,
    pub routing: RoutingSettings,
    pub models: HashMap<String, ModelGroup>,
}

impl Config {
    /// Load the base file at `path`, then deep-merge any sibling local overlay
    /// (`config.local.toml`, `config.personal.toml`, or `*.local.toml` next to it).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut doc: toml::Value = toml::from_str(&content).context("parsing config TOML")?;

        if let Some(overlay_path) = find_local_overlay(path) {
            let overlay_content = std::fs::read_to_string(&overlay_path)
                .with_context(|| format!("reading overlay {}", overlay_path.display()))?;
            let overlay: toml::Value =
                toml::from_str(&overlay_content).context("parsing overlay config TOML")?;
            deep_merge(&mut doc, overlay);
            tracing::info!(overlay = %overlay_path.display(), "merged local config overlay");
        }

        let raw: RawConfig = doc.try_into().context("deserializing merged config")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
        let mut models = HashMap::with_capacity(raw.models.len());
        for (name, group_cfg) in raw.models {
            let mut group = group_cfg.build(&name, &raw.routing.default_backend_mode)?;
            apply_env_overrides(&name, &mut group.endpoints);
            models.insert(name, group);
        }

        let config = Config {
            gateway: raw.gateway,
            proxy: raw.proxy,
            local_ollama: raw.local_ollama,
            routing: raw.routing,
            models,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, group) in &self.models {
            anyhow::ensure!(
                !group.available_models.is_empty() || name == "local",
                "model group `{name}` must declare available_models unless it is the `local` catch-all"
            );
        }
        Ok(())
    }

    /// Every configured virtual model, across every group, as `(group, virtual_name)`.
    pub fn all_virtual_models(&self) -> impl Iterator<Item = (&str, &str)> {
        self.models.iter().flat_map(|(g, group)| {
            group.available_models.keys().map(move |v| (g.as_str(), v.as_str()))
        })
    }
}

/// Environment variable override: `<GROUP>_API_KEY`, hyphens mapped to underscores, upper-cased.
fn apply_env_overrides(group_name: &str, endpoints: &mut [BackendEndpoint]) {
    let var_name = format!("{}_API_KEY", group_name.replace('-', "_").to_uppercase());
    if let Ok(value) = std::env::var(&var_name) {
        if !value.is_empty() {
            for ep in endpoints.iter_mut() {
                ep.api_key = Some(value.clone());
                if ep.base_url.contains("anthropic.com") {
                    ep.headers.insert("x-api-key".to_string(), value.clone());
                } else {
                    ep.headers.insert("Authorization".to_string(), format!("Bearer {value}"));
                }
            }
            tracing::info!(group = group_name, env_var = %var_name, "applied API key override from environment");
        }
    }
}

/// Finds a sibling local overlay file: `config.local.toml`, `config.personal.toml`,
/// or any `*.local.toml` in the same directory as `path`.
fn find_local_overlay(path: &Path) -> Option<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path.file_stem()?.to_str()?;

    for candidate in [format!("{stem}.local.toml"), format!("{stem}.personal.toml")] {
        let candidate_path = dir.join(candidate);
        if candidate_path.exists() {
            return Some(candidate_path);
        }
    }

    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_str()?;
        if name.ends_with(".local.toml") && entry.path() != path {
            return Some(entry.path());
        }
    }
    None
}

/// Recursively merges `overlay` on top of `base`, in place. Tables are merged
/// key-by-key; any other value type in `overlay` replaces `base` wholesale.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn local_ollama_base_url() -> String { "http://localhost:11434".to_string() }
    pub fn default_backend_mode() -> String { "openai_backend".to_string() }
    pub fn bool_true() -> bool { true }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [local_ollama]
        base_url = "http://localhost:11434"

        [models.deepseek]
        description = "DeepSeek"

        [models.deepseek.available_models.deepseek-chat]
        actual_model = "deepseek-chat"

        [models.deepseek.primary_backend]
        base_url = "https://api.deepseek.com/v1"
        api_key = "sk-test-123"

        [models.local]
        "#
    }

    fn parse(s: &str) -> Config {
        let doc: toml::Value = toml::from_str(s).expect("valid toml");
        let raw: RawConfig = doc.try_into().expect("raw config shape");
        Config::from_raw(raw).expect("config should build")
    }

    #[test]
    fn parses_minimal_config() {
        let config = parse(minimal_toml());
        assert!(config.models.contains_key("deepseek"));
        assert!(config.models.contains_key("local"));
    }

    #[test]
    fn local_group_may_have_empty_available_models() {
        let config = parse(minimal_toml());
        assert!(config.models["local"].available_models.is_empty());
    }

    #[test]
    fn non_local_group_without_available_models_is_rejected() {
        let bad = r#"
        [models.bad]
        [models.bad.primary_backend]
        base_url = "https://api.example.com"
        "#;
        let doc: toml::Value = toml::from_str(bad).unwrap();
        let raw: RawConfig = doc.try_into().unwrap();
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn backend_endpoint_gets_bearer_auth_header_by_default() {
        let config = parse(minimal_toml());
        let ep = &config.models["deepseek"].endpoints[0];
        assert_eq!(ep.headers.get("Authorization").unwrap(), "Bearer sk-test-123");
        assert!(!ep.headers.contains_key("x-api-key"));
    }

    #[test]
    fn anthropic_host_gets_x_api_key_header_instead_of_bearer() {
        let toml_str = r#"
        [models.claude]
        [models.claude.available_models.claude-opus]
        actual_model = "claude-opus-4"

        [models.claude.primary_backend]
        base_url = "https://api.anthropic.com/v1"
        api_key = "sk-ant-test"
        "#;
        let config = parse(toml_str);
        let ep = &config.models["claude"].endpoints[0];
        assert_eq!(ep.headers.get("x-api-key").unwrap(), "sk-ant-test");
        assert!(!ep.headers.contains_key("Authorization"));
    }

    #[test]
    fn content_type_header_always_present() {
        let config = parse(minimal_toml());
        let ep = &config.models["deepseek"].endpoints[0];
        assert_eq!(ep.headers.get("Content-Type").unwrap(), "application/json");
    }

    #[test]
    fn backend_type_derived_from_vendor_host_when_unspecified() {
        let config = parse(minimal_toml());
        let ep = &config.models["deepseek"].endpoints[0];
        assert_eq!(ep.backend_type, BackendType::OpenAi);
    }

    #[test]
    fn backend_type_localhost_maps_to_ollama() {
        let toml_str = r#"
        [models.local2]
        [models.local2.available_models.whatever]
        actual_model = "whatever"
        [models.local2.secondary_backend]
        base_url = "http://127.0.0.1:11434"
        "#;
        let config = parse(toml_str);
        let ep = &config.models["local2"].endpoints[0];
        assert_eq!(ep.backend_type, BackendType::Ollama);
    }

    #[test]
    fn explicit_backend_type_alias_is_normalized() {
        let toml_str = r#"
        [models.x]
        [models.x.available_models.m]
        actual_model = "m"
        [models.x.primary_backend]
        base_url = "https://internal.example.com"
        backend_type = "openai_compat"
        "#;
        let config = parse(toml_str);
        assert_eq!(config.models["x"].endpoints[0].backend_type, BackendType::OpenAi);
    }

    #[test]
    fn router_name_combines_group_and_backend_mode() {
        let config = parse(minimal_toml());
        let ep = &config.models["deepseek"].endpoints[0];
        assert_eq!(ep.router_name(), "deepseek.primary_backend");
    }

    #[test]
    fn actual_model_applies_model_mapping_when_present() {
        let toml_str = r#"
        [models.g]
        [models.g.available_models.v]
        actual_model = "v-internal"
        [models.g.primary_backend]
        base_url = "https://api.example.com"
        [models.g.primary_backend.model_mapping]
        v-internal = "v-upstream"
        "#;
        let config = parse(toml_str);
        let ep = &config.models["g"].endpoints[0];
        assert_eq!(ep.actual_model("v-internal"), Some("v-upstream"));
        assert_eq!(ep.actual_model("unmapped"), Some("unmapped"));
    }

    #[test]
    fn deep_merge_overlays_nested_tables_without_clobbering_siblings() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [models.a]
            [models.a.primary_backend]
            base_url = "https://a.example.com"
            api_key = "base-key"
            "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [models.a.primary_backend]
            api_key = "overlay-key"
            "#,
        )
        .unwrap();
        deep_merge(&mut base, overlay);
        let base_url = base["models"]["a"]["primary_backend"]["base_url"].as_str().unwrap();
        let api_key = base["models"]["a"]["primary_backend"]["api_key"].as_str().unwrap();
        assert_eq!(base_url, "https://a.example.com", "untouched sibling key must survive merge");
        assert_eq!(api_key, "overlay-key");
    }

    #[test]
    fn env_var_override_replaces_api_key_and_header() {
        let var = "DEEPSEEK_API_KEY";
        unsafe { std::env::set_var(var, "sk-from-env") };
        let config = parse(minimal_toml());
        unsafe { std::env::remove_var(var) };

        let ep = &config.models["deepseek"].endpoints[0];
        assert_eq!(ep.api_key.as_deref(), Some("sk-from-env"));
        assert_eq!(ep.headers.get("Authorization").unwrap(), "Bearer sk-from-env");
    }

    #[test]
    fn endpoint_order_follows_toml_declaration_not_alphabetical_sort() {
        let toml_str = r#"
        [models.g]
        [models.g.available_models.v]
        actual_model = "v"

        [models.g.secondary_backend]
        base_url = "https://second.example.com"

        [models.g.primary_backend]
        base_url = "https://first.example.com"
        "#;
        let config = parse(toml_str);
        let urls: Vec<&str> = config.models["g"].endpoints.iter().map(|e| e.base_url.as_str()).collect();
        assert_eq!(urls, vec!["https://second.example.com", "https://first.example.com"]);
    }

    #[test]
    fn gateway_defaults_applied_when_section_absent() {
        let config = parse(minimal_toml());
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.gateway.traffic_log_capacity, 500);
    }

    #[test]
    fn proxy_compression_flags_default_to_true() {
        let config = parse(minimal_toml());
        assert!(config.proxy.tool_compression_enabled);
        assert!(config.proxy.prompt_compression_enabled);
    }
}
