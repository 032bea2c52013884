//! Configuration types for smart-ai-router.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 7601
//!
//! [providers.siliconflow]
//! adapter  = "openai"
//! base_url = "https://api.siliconflow.cn"
//!
//! [[channels]]
//! id       = "sf-free"
//! name     = "SiliconFlow free tier"
//! provider = "siliconflow"
//! api_key  = "sk-..."
//! model    = "*"
//! tags     = ["free"]
//! ```

use std::{collections::HashMap, path::{Path, PathBuf}};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::score::Strategy;

/// Which API dialect an upstream provider speaks.
///
/// The router normalises all traffic to OpenAI's chat-completions schema;
/// each variant maps to an adapter that handles request/response translation
/// at the edge. New providers require a new variant — code, not config.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Standard OpenAI `/v1/chat/completions` protocol.
    /// Also used by OpenRouter, SiliconFlow, vLLM, and many others.
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    /// Anthropic Messages API (`/v1/messages`).
    /// Request and response shapes are translated to/from the OpenAI schema.
    Anthropic,
    /// Google Gemini `generateContent` API.
    Gemini,
    /// OpenAI-compatible local inference (Ollama, LM Studio): keyless,
    /// loopback base URL.
    Local,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Local => "local",
        })
    }
}

/// Static description of an upstream API family. Immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub adapter: AdapterKind,

    /// Base URL without a trailing slash (normalised at load).
    pub base_url: String,

    /// Extra headers sent on every request to this provider
    /// (e.g. `anthropic-version`).
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
}

/// Per-channel currency conversion.
///
/// `rate` units of `from` currency buy one unit of `to` currency; the quoted
/// price is multiplied by `rate` to get the effective cost.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CurrencyExchange {
    pub from: String,
    pub to: String,
    pub rate: f64,
    #[serde(default)]
    pub description: Option<String>,
}

/// A concrete, enabled upstream endpoint: {provider, credential, options}.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,

    /// Provider id — must exist in `[providers]`.
    pub provider: String,

    #[serde(default)]
    pub api_key: String,

    /// Additional keys for the same endpoint. Discovery polls each key
    /// separately; the first key is used for routing.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Bound model id, or `*` to serve whatever discovery finds.
    #[serde(default = "defaults::model")]
    pub model: String,

    /// Channel-level tags (`free`, `local`, …) joined with model tags at
    /// index time.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Tie-break priority among equal scores. Higher wins.
    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub daily_request_limit: Option<u64>,

    /// Per-attempt timeout in milliseconds (default: 60 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Per-channel override of the attempt budget.
    #[serde(default)]
    pub retry_budget: Option<u32>,

    /// Cost override per 1K prompt tokens (takes precedence over every
    /// pricing source).
    #[serde(default)]
    pub cost_per_1k_input: Option<f64>,

    /// Cost override per 1K completion tokens.
    #[serde(default)]
    pub cost_per_1k_output: Option<f64>,

    #[serde(default)]
    pub currency_exchange: Option<CurrencyExchange>,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl ChannelConfig {
    /// All keys discovery should poll: `api_keys` plus the primary.
    pub fn effective_api_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        if !self.api_key.is_empty() {
            keys.push(self.api_key.as_str());
        }
        for key in &self.api_keys {
            if !key.is_empty() && !keys.contains(&key.as_str()) {
                keys.push(key.as_str());
            }
        }
        keys
    }

    /// Configured per-1K cost override, if both sides are present.
    pub fn cost_override(&self) -> Option<(f64, f64)> {
        match (self.cost_per_1k_input, self.cost_per_1k_output) {
            (Some(input), Some(output)) => Some((input, output)),
            _ => None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Currency multiplier applied to quoted USD prices (1.0 when absent).
    pub fn fx_rate(&self) -> f64 {
        self.currency_exchange.as_ref().map_or(1.0, |fx| fx.rate)
    }
}

/// Client and admin authentication.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub admin: AdminAuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdminAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

/// Candidate filters applied before scoring.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelFilters {
    #[serde(default = "defaults::min_context_length")]
    pub min_context_length: u64,
    #[serde(default)]
    pub min_parameter_count: Option<u64>,
    #[serde(default = "defaults::enabled")]
    pub exclude_embedding_models: bool,
}

impl Default for ModelFilters {
    fn default() -> Self {
        Self {
            min_context_length: defaults::min_context_length(),
            min_parameter_count: None,
            exclude_embedding_models: true,
        }
    }
}

/// Routing behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_strategy: Strategy,
    /// Attempts across all candidates before giving up (default: 3).
    #[serde(default = "defaults::max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Total deadline across all attempts, in seconds (default: 300).
    #[serde(default = "defaults::request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Base cooldown seconds after a recoverable failure (default: 30).
    #[serde(default = "defaults::error_cooldown_period")]
    pub error_cooldown_period: u64,
    #[serde(default = "defaults::enabled")]
    pub enable_fallback: bool,
    #[serde(default)]
    pub model_filters: ModelFilters,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::default(),
            max_retry_attempts: defaults::max_retry_attempts(),
            request_timeout_seconds: defaults::request_timeout_seconds(),
            error_cooldown_period: defaults::error_cooldown_period(),
            enable_fallback: true,
            model_filters: ModelFilters::default(),
        }
    }
}

/// Routing-cache tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "defaults::cache_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(default = "defaults::max_cache_entries")]
    pub max_cache_entries: usize,
    #[serde(default = "defaults::cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: defaults::cache_ttl_seconds(),
            max_cache_entries: defaults::max_cache_entries(),
            cleanup_interval_seconds: defaults::cleanup_interval_seconds(),
        }
    }
}

/// Spend guard-rails.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CostControlConfig {
    #[serde(default)]
    pub global_daily_budget: Option<f64>,
    #[serde(default)]
    pub alert_threshold: Option<f64>,
    #[serde(default)]
    pub auto_disable_on_budget_exceeded: bool,
}

/// Background model-discovery tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::discovery_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "defaults::discovery_concurrency")]
    pub concurrency: usize,
    #[serde(default = "defaults::discovery_attempt_timeout_seconds")]
    pub attempt_timeout_seconds: u64,
    #[serde(default = "defaults::discovery_channel_timeout_seconds")]
    pub channel_timeout_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: defaults::discovery_interval_seconds(),
            concurrency: defaults::discovery_concurrency(),
            attempt_timeout_seconds: defaults::discovery_attempt_timeout_seconds(),
            channel_timeout_seconds: defaults::discovery_channel_timeout_seconds(),
        }
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Listen port (default: 7601).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Flat token charge per image in a multimodal request (default: 250).
    #[serde(default = "defaults::image_tokens")]
    pub image_tokens: u64,

    /// Path to the provider static pricing file (JSON). Optional.
    #[serde(default)]
    pub pricing_file: Option<PathBuf>,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            image_tokens: defaults::image_tokens(),
            pricing_file: None,
            log_level: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Named providers (OpenAI-compatible endpoints, Anthropic, Gemini, local).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub cost_control: CostControlConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        for provider in config.providers.values_mut() {
            provider.base_url = provider.base_url.trim_end_matches('/').to_string();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        // Every channel must reference a known provider
        for channel in &self.channels {
            anyhow::ensure!(
                self.providers.contains_key(&channel.provider),
                "channel `{}` references unknown provider `{}`",
                channel.id,
                channel.provider
            );
        }

        // Channel ids must be unique
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            anyhow::ensure!(
                seen.insert(channel.id.as_str()),
                "duplicate channel id `{}`",
                channel.id
            );
        }

        for provider in self.providers.values() {
            anyhow::ensure!(!provider.base_url.is_empty(), "provider base_url must not be empty");
        }

        for channel in &self.channels {
            if let Some(fx) = &channel.currency_exchange {
                anyhow::ensure!(
                    fx.rate > 0.0,
                    "channel `{}` currency_exchange rate must be positive",
                    channel.id
                );
            }
        }

        anyhow::ensure!(
            self.routing.max_retry_attempts >= 1,
            "routing.max_retry_attempts must be at least 1"
        );

        if self.auth.admin.enabled {
            anyhow::ensure!(
                !self.auth.admin.token.is_empty(),
                "auth.admin.token must be set when admin auth is enabled"
            );
        }

        Ok(())
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn provider_of<'a>(&'a self, channel: &ChannelConfig) -> Option<&'a ProviderConfig> {
        self.providers.get(&channel.provider)
    }

    /// Whether a channel counts as local: tagged so, served by the local
    /// adapter, or pointed at a loopback/private base URL.
    pub fn is_local_channel(&self, channel: &ChannelConfig) -> bool {
        if channel.has_tag("local") || channel.has_tag("ollama") || channel.has_tag("lmstudio") {
            return true;
        }
        match self.provider_of(channel) {
            Some(p) if p.adapter == AdapterKind::Local => true,
            Some(p) => is_private_base_url(&p.base_url),
            None => false,
        }
    }
}

/// Loopback and RFC-1918 hosts count as local.
pub fn is_private_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => {
            if let Ok(ip) = host.parse::<std::net::IpAddr>() {
                match ip {
                    std::net::IpAddr::V4(v4) => {
                        v4.is_loopback() || v4.is_private() || v4.is_unspecified()
                    }
                    std::net::IpAddr::V6(v6) => v6.is_loopback(),
                }
            } else {
                false
            }
        }
        None => false,
    }
}

mod defaults {
    pub fn port() -> u16 { 7601 }
    pub fn model() -> String { "*".to_string() }
    pub fn enabled() -> bool { true }
    pub fn timeout_ms() -> u64 { 60_000 }
    pub fn min_context_length() -> u64 { 2_048 }
    pub fn max_retry_attempts() -> u32 { 3 }
    pub fn request_timeout_seconds() -> u64 { 300 }
    pub fn error_cooldown_period() -> u64 { 30 }
    pub fn cache_ttl_seconds() -> i64 { 60 }
    pub fn max_cache_entries() -> usize { 1_000 }
    pub fn cleanup_interval_seconds() -> u64 { 60 }
    pub fn image_tokens() -> u64 { 250 }
    pub fn discovery_interval_seconds() -> u64 { 6 * 60 * 60 }
    pub fn discovery_concurrency() -> usize { 8 }
    pub fn discovery_attempt_timeout_seconds() -> u64 { 30 }
    pub fn discovery_channel_timeout_seconds() -> u64 { 120 }
}
