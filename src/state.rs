//! Shared application state injected into every request handler.
//!
//! All cross-request state lives here: the hot-reloadable config, the tag
//! index snapshot, the model catalog, the routing cache, the blacklist,
//! rolling channel stats, and the session cost totals. Subsystems reference
//! each other only through this struct and by stable string ids — never by
//! direct pointers — so invalidation stays a targeted set operation.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use chrono::Utc;

use crate::{
    blacklist::Blacklist,
    cache::RequestCache,
    catalog::{discovery_cache_key, KeyCatalog, ModelCatalog, ModelRecord, UserTier},
    config::Config,
    cost::SessionTotals,
    pricing::{ModelPricing, PricingStore},
    score::Strategy,
    stats::{DailyCounters, RollingStats},
    tags::TagIndex,
};

pub struct RouterState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: RwLock<Arc<Config>>,
    /// Path to the config file on disk — used by the hot-reload background task.
    pub config_path: PathBuf,
    /// Tag index snapshot. Rebuilt by discovery, swapped in atomically;
    /// the request path only ever reads a snapshot.
    index_lock: RwLock<Arc<TagIndex>>,
    /// Active routing strategy; admin-switchable at runtime.
    strategy_lock: RwLock<Strategy>,
    /// Per-(channel, key) model catalogs from discovery.
    pub catalog: ModelCatalog,
    /// Fingerprint → selection cache.
    pub cache: RequestCache,
    /// Failure cooldown ledger.
    pub blacklist: Blacklist,
    /// Latency EMA + rolling success rate per channel.
    pub stats: RollingStats,
    /// Per-channel daily request counters.
    pub daily: DailyCounters,
    /// Process-wide request/cost totals.
    pub session: SessionTotals,
    /// Static provider pricing + resolution logic.
    pub pricing: PricingStore,
    /// Gateway start time, for the health endpoint.
    pub started_at: std::time::Instant,
}

impl RouterState {
    pub fn new(config: Arc<Config>, config_path: PathBuf, pricing: PricingStore) -> Self {
        let strategy = config.routing.default_strategy;
        let cache = RequestCache::new(
            config.cache.default_ttl_seconds,
            config.cache.max_cache_entries,
        );
        let state = Self {
            config_lock: RwLock::new(config),
            config_path,
            index_lock: RwLock::new(Arc::new(TagIndex::default())),
            strategy_lock: RwLock::new(strategy),
            catalog: ModelCatalog::new(),
            cache,
            blacklist: Blacklist::new(),
            stats: RollingStats::new(),
            daily: DailyCounters::new(),
            session: SessionTotals::new(),
            pricing,
            started_at: std::time::Instant::now(),
        };
        state.seed_catalog();
        state.rebuild_index();
        state
    }

    /// Returns a snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config, then re-seeds derived state.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
        self.seed_catalog();
        self.rebuild_index();
    }

    /// Current tag index snapshot.
    pub fn index(&self) -> Arc<TagIndex> {
        self.index_lock.read().expect("index lock poisoned").clone()
    }

    pub fn active_strategy(&self) -> Strategy {
        *self.strategy_lock.read().expect("strategy lock poisoned")
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy_lock.write().expect("strategy lock poisoned") = strategy;
    }

    /// Seed the catalog from config for channels bound to a single model, so
    /// routing works before the first discovery cycle completes.
    pub fn seed_catalog(&self) {
        let config = self.config();
        for channel in config.channels.iter().filter(|c| c.enabled && c.model != "*") {
            let mut record = ModelRecord::new(&channel.id, &channel.model);
            if let Some((input, output)) = channel.cost_override() {
                record.pricing = Some(ModelPricing {
                    prompt_per_token: input / 1000.0,
                    completion_per_token: output / 1000.0,
                    currency: "USD".to_string(),
                });
            }
            let seed_key = if channel.api_key.is_empty() { "static" } else { &channel.api_key };
            self.catalog.update_key(KeyCatalog {
                cache_key: discovery_cache_key(&channel.id, seed_key),
                channel_id: channel.id.clone(),
                api_key_hash: crate::catalog::api_key_hash(seed_key),
                user_tier: UserTier::Unknown,
                models: vec![record],
                last_updated: Utc::now(),
            });
        }
    }

    /// Rebuild the tag index from the current catalog, skipping the work when
    /// the catalog content hash is unchanged.
    pub fn rebuild_index(&self) {
        let config = self.config();
        let entries = self.catalog.entries();
        let no_tags: Vec<String> = Vec::new();
        let with_tags: Vec<(&str, &str, &[String])> = entries
            .iter()
            .map(|(channel_id, model_id)| {
                let tags = config
                    .channel(channel_id)
                    .map(|c| c.tags.as_slice())
                    .unwrap_or(no_tags.as_slice());
                (channel_id.as_str(), model_id.as_str(), tags)
            })
            .collect();

        let fresh = TagIndex::build(with_tags);
        {
            let current = self.index_lock.read().expect("index lock poisoned");
            if current.content_hash() == fresh.content_hash() && current.stats().total_models > 0 {
                return;
            }
        }
        *self.index_lock.write().expect("index lock poisoned") = Arc::new(fresh);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use crate::config::AdapterKind;

    #[test]
    fn seeding_populates_catalog_for_bound_channels() {
        let cfg = config(
            vec![("p", provider(AdapterKind::OpenAI, "https://api.example.com"))],
            vec![channel("ch-a", "p", "qwen3-8b"), channel("ch-b", "p", "*")],
        );
        let state = state(cfg);

        assert!(state.catalog.record("ch-a", "qwen3-8b").is_some());
        // Discover-all channels have nothing until discovery runs.
        assert!(state.catalog.record("ch-b", "qwen3-8b").is_none());
    }

    #[test]
    fn seeded_index_finds_bound_models_by_tag() {
        let mut free_channel = channel("ch-free", "p", "qwen3-8b");
        free_channel.tags = vec!["free".to_string()];
        let cfg = config(
            vec![("p", provider(AdapterKind::OpenAI, "https://api.example.com"))],
            vec![free_channel],
        );
        let state = state(cfg);

        let hits = state.index().find(&["free".into(), "qwen3".into()], &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].channel_id, "ch-free");
    }

    #[test]
    fn strategy_is_switchable() {
        let cfg = config(vec![], vec![]);
        let state = state(cfg);
        assert_eq!(state.active_strategy(), crate::score::Strategy::FreeFirst);
        state.set_strategy(crate::score::Strategy::SpeedOptimized);
        assert_eq!(state.active_strategy(), crate::score::Strategy::SpeedOptimized);
    }

    #[test]
    fn seeded_channel_cost_override_becomes_pricing() {
        let mut paid = channel("ch-paid", "p", "qwen3-8b");
        paid.cost_per_1k_input = Some(0.3);
        paid.cost_per_1k_output = Some(0.9);
        let cfg = config(
            vec![("p", provider(AdapterKind::OpenAI, "https://api.example.com"))],
            vec![paid],
        );
        let state = state(cfg);

        let pricing = state.catalog.discovered_pricing("ch-paid", "qwen3-8b").unwrap();
        assert!((pricing.prompt_per_token - 0.0003).abs() < 1e-12);
    }
}
