//! Background model discovery.
//!
//! A bounded worker pool polls every enabled channel's catalog endpoint on a
//! fixed interval (and once at startup). Each configured API key of a channel
//! is polled separately and lands in its own per-key catalog — different keys
//! on the same provider can legitimately see different models and prices, so
//! their results are never merged. Discovery failures log and leave the
//! previous catalog in place; they never disable a channel.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    adapters::{AdapterClient, DiscoveredModel},
    catalog::{
        api_key_hash, classify_user_tier, discovery_cache_key, Capability, KeyCatalog, ModelRecord,
    },
    config::{ChannelConfig, ProviderConfig},
    pricing::ModelPricing,
    state::RouterState,
};

/// Discovery loop: refresh at startup, then on every interval tick.
pub async fn run(state: Arc<RouterState>) {
    let interval_secs = state.config().discovery.interval_seconds.max(60);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        // The first tick completes immediately — that is the startup refresh.
        interval.tick().await;
        run_once(&state).await;
    }
}

/// One full refresh across all enabled channels.
pub async fn run_once(state: &Arc<RouterState>) {
    let config = state.config();
    if !config.discovery.enabled {
        return;
    }

    let semaphore = Arc::new(Semaphore::new(config.discovery.concurrency.max(1)));
    let mut handles = Vec::new();

    for channel in config.channels.iter().filter(|c| c.enabled).cloned() {
        let Some(provider) = config.provider_of(&channel).cloned() else {
            continue;
        };
        let state = Arc::clone(state);
        let semaphore = Arc::clone(&semaphore);
        let attempt_timeout = config.discovery.attempt_timeout_seconds;
        let channel_timeout = config.discovery.channel_timeout_seconds;

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else { return };
            let budget = Duration::from_secs(channel_timeout);
            let work = discover_channel(&state, &provider, &channel, attempt_timeout);
            if tokio::time::timeout(budget, work).await.is_err() {
                warn!(channel = %channel.id, "discovery exceeded the per-channel budget");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    state.rebuild_index();
    debug!("discovery cycle complete");
}

/// Recovery loop for auth-parked channels.
///
/// An auth-fatal failure blacklists a channel indefinitely; the only ways out
/// are an operator reset or a successful health check. This probe retries
/// parked channels every five minutes.
pub async fn health_reset(state: Arc<RouterState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    interval.tick().await; // skip the immediate first tick
    loop {
        interval.tick().await;
        health_reset_once(&state).await;
    }
}

/// Probe every indefinitely-parked channel once; clear the ones that answer.
pub async fn health_reset_once(state: &RouterState) {
    let config = state.config();
    for entry in state.blacklist.active_entries().await {
        // Only indefinite (auth-fatal) entries qualify; bounded cooldowns
        // expire on their own.
        if entry.model_id != crate::blacklist::WILDCARD_MODEL || entry.blacklisted_until.is_some()
        {
            continue;
        }
        let Some(channel) = config.channel(&entry.channel_id) else { continue };
        let Some(provider) = config.provider_of(channel) else { continue };
        let Ok(client) = AdapterClient::new(provider, channel) else { continue };

        // Liveness first, then key validity — an auth-parked channel only
        // recovers when its credential actually works again.
        if let Err(e) = client.health_check().await {
            debug!(channel = %channel.id, error = %e, "parked channel still unhealthy");
            continue;
        }
        match client.validate_key().await {
            Ok(info) if info.valid => {
                state.blacklist.clear_channel(&channel.id).await;
                info!(channel = %channel.id, models = info.model_count, "key validated — channel recovered");
            }
            Ok(_) => {
                debug!(channel = %channel.id, "parked channel key is still rejected");
            }
            Err(e) => {
                debug!(channel = %channel.id, error = %e, "key validation failed");
            }
        }
    }
}

/// Poll every key of one channel.
async fn discover_channel(
    state: &RouterState,
    provider: &ProviderConfig,
    channel: &ChannelConfig,
    attempt_timeout_secs: u64,
) {
    let keys = channel.effective_api_keys();
    if keys.is_empty() {
        // Keyless (local) channels still discover with an anonymous client.
        discover_key(state, provider, channel, "", attempt_timeout_secs).await;
        return;
    }
    for key in keys {
        discover_key(state, provider, channel, key, attempt_timeout_secs).await;
    }
}

async fn discover_key(
    state: &RouterState,
    provider: &ProviderConfig,
    channel: &ChannelConfig,
    api_key: &str,
    attempt_timeout_secs: u64,
) {
    let client = match AdapterClient::with_key(provider, channel, api_key) {
        Ok(client) => client,
        Err(e) => {
            warn!(channel = %channel.id, error = %e, "discovery client build failed");
            return;
        }
    };

    let attempt = Duration::from_secs(attempt_timeout_secs.max(1));
    let models = match tokio::time::timeout(attempt, client.list_models()).await {
        Ok(Ok(models)) => models,
        Ok(Err(e)) => {
            warn!(channel = %channel.id, error = %e, "discovery failed — keeping previous catalog");
            return;
        }
        Err(_) => {
            warn!(channel = %channel.id, "discovery attempt timed out — keeping previous catalog");
            return;
        }
    };

    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    let user_tier = classify_user_tier(&ids);
    let records = build_records(channel, models);
    let count = records.len();

    let seed_key = if api_key.is_empty() { "static" } else { api_key };
    state.catalog.update_key(KeyCatalog {
        cache_key: discovery_cache_key(&channel.id, seed_key),
        channel_id: channel.id.clone(),
        api_key_hash: api_key_hash(seed_key),
        user_tier,
        models: records,
        last_updated: Utc::now(),
    });

    info!(channel = %channel.id, models = count, tier = ?user_tier, "catalog refreshed");
}

/// Turn discovered entries into model records, honoring a channel's single
/// model binding.
fn build_records(channel: &ChannelConfig, models: Vec<DiscoveredModel>) -> Vec<ModelRecord> {
    models
        .into_iter()
        .filter(|m| channel.model == "*" || channel.model == m.id)
        .map(|m| {
            let mut record = ModelRecord::new(&channel.id, &m.id);
            record.context_length = m.context_length.or_else(|| context_from_tags(&record.tags));
            record.parameter_count = parameter_count_from_tags(&record.tags);
            if m.supports_tools {
                record.capabilities.insert(Capability::FunctionCalling);
            }
            if m.supports_vision || record.tags.contains("vision") {
                record.capabilities.insert(Capability::Vision);
            }
            if record.tags.contains("code") {
                record.capabilities.insert(Capability::Code);
            }
            if let (Some(prompt), Some(completion)) =
                (m.prompt_price_per_token, m.completion_price_per_token)
            {
                record.pricing = Some(ModelPricing {
                    prompt_per_token: prompt,
                    completion_per_token: completion,
                    currency: "USD".to_string(),
                });
            }
            record
        })
        .collect()
}

/// `30b` → 30 000 000 000. Derived tags are the only parameter-count source
/// most catalogs offer.
fn parameter_count_from_tags(tags: &std::collections::BTreeSet<String>) -> Option<u64> {
    tags.iter()
        .filter_map(|t| t.strip_suffix('b'))
        .filter_map(|n| n.parse::<f64>().ok())
        .map(|n| (n * 1_000_000_000.0) as u64)
        .max()
}

/// `128k` → 128 000 tokens, as a fallback when the catalog has no limit.
fn context_from_tags(tags: &std::collections::BTreeSet<String>) -> Option<u64> {
    tags.iter()
        .filter_map(|t| t.strip_suffix('k'))
        .filter_map(|n| n.parse::<f64>().ok())
        .map(|n| (n * 1_000.0) as u64)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterKind;
    use crate::state::test_support::{channel, config, provider, state};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_body(ids: &[&str]) -> serde_json::Value {
        json!({
            "object": "list",
            "data": ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        })
    }

    #[tokio::test]
    async fn discovery_populates_catalog_and_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "qwen/qwen3-30b-a3b:free",
                    "context_length": 131072,
                    "pricing": { "prompt": "0", "completion": "0" },
                }]
            })))
            .mount(&server)
            .await;

        let st = state(config(
            vec![("p", provider(AdapterKind::OpenAI, &server.uri()))],
            vec![channel("ch-a", "p", "*")],
        ));
        run_once(&st).await;

        let record = st.catalog.record("ch-a", "qwen/qwen3-30b-a3b:free").expect("discovered");
        assert_eq!(record.context_length, Some(131072));
        assert_eq!(record.parameter_count, Some(30_000_000_000));
        assert!(record.pricing.is_some());

        // The index picked up the new model's tags.
        let hits = st.index().find(&["qwen3".into(), "30b".into()], &[]);
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn each_key_gets_its_own_catalog_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer key-one"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body(&["m-basic"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer key-two"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(catalog_body(&["m-basic", "Pro/m-fancy"])),
            )
            .mount(&server)
            .await;

        let mut ch = channel("ch-a", "p", "*");
        ch.api_key = "key-one".into();
        ch.api_keys = vec!["key-two".into()];
        let st = state(config(
            vec![("p", provider(AdapterKind::OpenAI, &server.uri()))],
            vec![ch],
        ));
        run_once(&st).await;

        let summaries = st.catalog.key_summaries();
        assert_eq!(summaries.len(), 2, "one catalog per key");
        // The Pro/ family marks the second key as a pro account.
        assert!(summaries.iter().any(|s| s["user_tier"] == "pro"));
    }

    #[tokio::test]
    async fn failed_discovery_keeps_previous_catalog() {
        let server = MockServer::start().await;
        let ok = Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body(&["survivor"])))
            .up_to_n_times(1)
            .mount_as_scoped(&server)
            .await;

        let st = state(config(
            vec![("p", provider(AdapterKind::OpenAI, &server.uri()))],
            vec![channel("ch-a", "p", "*")],
        ));
        run_once(&st).await;
        assert!(st.catalog.record("ch-a", "survivor").is_some());
        drop(ok);

        // Second cycle fails; the previous catalog must survive.
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        run_once(&st).await;
        assert!(st.catalog.record("ch-a", "survivor").is_some());
    }

    #[tokio::test]
    async fn bound_channel_keeps_only_its_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(catalog_body(&["wanted", "unwanted"])),
            )
            .mount(&server)
            .await;

        let st = state(config(
            vec![("p", provider(AdapterKind::OpenAI, &server.uri()))],
            vec![channel("ch-a", "p", "wanted")],
        ));
        run_once(&st).await;

        assert!(st.catalog.record("ch-a", "wanted").is_some());
        assert!(st.catalog.record("ch-a", "unwanted").is_none());
    }

    #[tokio::test]
    async fn health_reset_recovers_auth_parked_channels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body(&["m"])))
            .mount(&server)
            .await;

        let st = state(config(
            vec![("p", provider(AdapterKind::OpenAI, &server.uri()))],
            vec![channel("ch-a", "p", "qwen3-8b")],
        ));
        st.blacklist
            .record_failure("ch-a", "qwen3-8b", crate::error::ErrorKind::AuthFatal)
            .await;
        assert!(st.blacklist.is_blocked("ch-a", "qwen3-8b").await);

        health_reset_once(&st).await;
        assert!(!st.blacklist.is_blocked("ch-a", "qwen3-8b").await);
    }

    #[tokio::test]
    async fn health_reset_leaves_bounded_cooldowns_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body(&["m"])))
            .mount(&server)
            .await;

        let st = state(config(
            vec![("p", provider(AdapterKind::OpenAI, &server.uri()))],
            vec![channel("ch-a", "p", "qwen3-8b")],
        ));
        st.blacklist
            .record_failure("ch-a", "qwen3-8b", crate::error::ErrorKind::RateLimit)
            .await;

        health_reset_once(&st).await;
        // A rate-limit cooldown is not a health problem; it must ride out its timer.
        assert!(st.blacklist.is_blocked("ch-a", "qwen3-8b").await);
    }

    #[test]
    fn parameter_and_context_parsing_from_tags() {
        let tags = crate::tags::extract("yi-34b-200k");
        assert_eq!(parameter_count_from_tags(&tags), Some(34_000_000_000));
        assert_eq!(context_from_tags(&tags), Some(200_000));

        let fractional = crate::tags::extract("qwen2.5-0.5b-instruct");
        assert_eq!(parameter_count_from_tags(&fractional), Some(500_000_000));
    }
}
