//! Candidate discovery — the routing pipeline's front half.
//!
//! A request names either a concrete model id or a tag expression
//! (`tag:free,qwen3,!vision`). This module resolves that expression against
//! the tag index and the channel table, filters out everything ineligible
//! (disabled, blacklisted, wrong capabilities, too expensive, not
//! chat-suitable), scores the survivors, and returns them best-first. The
//! result is cached by request fingerprint so repeated routing shapes skip
//! the whole pipeline.

use serde_json::Value;

use crate::{
    cache::{fingerprint, FingerprintInput},
    catalog::{Capability, ModelRecord},
    config::{ChannelConfig, Config},
    cost,
    error::RouterError,
    pricing::PriceSource,
    score::{self, RoutingScore, Strategy},
    state::RouterState,
    tags,
};

/// The routing-relevant view of an inbound request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub model: String,
    pub strategy: Strategy,
    pub required_capabilities: Vec<Capability>,
    pub min_context_length: u64,
    pub max_cost_per_1k: Option<f64>,
    pub exclude_providers: Vec<String>,
    pub prefer_local: bool,
    pub stream: bool,
    pub has_functions: bool,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub messages: Vec<Value>,
}

impl RouteRequest {
    /// Validate and extract the routing fields from an OpenAI-shaped body.
    ///
    /// Optional router extension fields (`strategy`, `required_capabilities`,
    /// `exclude_providers`, `prefer_local`, `min_context_length`,
    /// `max_cost_per_1k`) are honored and later stripped before forwarding.
    pub fn from_body(
        body: &Value,
        config: &Config,
        default_strategy: Strategy,
    ) -> Result<Self, RouterError> {
        let model = body["model"]
            .as_str()
            .ok_or_else(|| RouterError::InvalidRequest("`model` is required".into()))?
            .to_string();

        let messages = body["messages"]
            .as_array()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                RouterError::InvalidRequest("`messages` must be a non-empty array".into())
            })?
            .clone();

        let max_tokens = match body.get("max_tokens") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(0) => {
                    return Err(RouterError::InvalidRequest("`max_tokens` must be positive".into()))
                }
                Some(n) => Some(n),
                None => {
                    return Err(RouterError::InvalidRequest("`max_tokens` must be an integer".into()))
                }
            },
        };

        let strategy = body["strategy"]
            .as_str()
            .and_then(Strategy::parse)
            .unwrap_or(default_strategy);

        let required_capabilities = body["required_capabilities"]
            .as_array()
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .filter_map(Capability::parse)
                    .collect()
            })
            .unwrap_or_default();

        let exclude_providers = body["exclude_providers"]
            .as_array()
            .map(|ps| ps.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        Ok(Self {
            model,
            strategy,
            required_capabilities,
            exclude_providers,
            min_context_length: body["min_context_length"]
                .as_u64()
                .unwrap_or(config.routing.model_filters.min_context_length),
            max_cost_per_1k: body["max_cost_per_1k"].as_f64(),
            prefer_local: body["prefer_local"].as_bool().unwrap_or(false),
            stream: body["stream"].as_bool().unwrap_or(false),
            has_functions: body["tools"].as_array().is_some_and(|t| !t.is_empty()),
            max_tokens,
            temperature: body["temperature"].as_f64(),
            messages,
        })
    }

    /// Fingerprint input for the routing cache (message content excluded).
    fn fingerprint(&self) -> String {
        let capabilities: Vec<String> = self
            .required_capabilities
            .iter()
            .map(|c| format!("{c:?}").to_lowercase())
            .collect();
        fingerprint(&FingerprintInput {
            model: &self.model,
            strategy: &self.strategy.to_string(),
            required_capabilities: &capabilities,
            exclude_providers: &self.exclude_providers,
            min_context_length: self.min_context_length,
            max_cost_per_1k: self.max_cost_per_1k,
            prefer_local: self.prefer_local,
            has_functions: self.has_functions,
            stream: self.stream,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }
}

/// A parsed model expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelQuery {
    /// `tag:a,b,!c` — positive tags required, `!` tags forbidden.
    Tags { positive: Vec<String>, negative: Vec<String> },
    /// A concrete model id.
    Concrete(String),
}

impl ModelQuery {
    pub fn parse(expr: &str) -> Self {
        match expr.strip_prefix("tag:") {
            Some(spec) => {
                let mut positive = Vec::new();
                let mut negative = Vec::new();
                for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    match token.strip_prefix('!') {
                        Some(neg) => negative.push(neg.to_lowercase()),
                        None => positive.push(token.to_lowercase()),
                    }
                }
                Self::Tags { positive, negative }
            }
            None => Self::Concrete(expr.to_string()),
        }
    }

    fn requires_free(&self) -> bool {
        match self {
            Self::Tags { positive, .. } => positive.iter().any(|t| t == "free"),
            Self::Concrete(_) => false,
        }
    }
}

/// One scored, eligible (channel, model) pair.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel_id: String,
    pub channel_name: String,
    pub provider: String,
    pub model_id: String,
    pub score: RoutingScore,
    pub sort_key: u64,
    pub priority: i32,
    pub est_cost_usd: f64,
    pub pricing_source: PriceSource,
    pub tags: Vec<String>,
    pub reason: String,
}

/// Resolve a request to its ordered candidate list.
///
/// Consults the routing cache first; on a miss runs the full
/// match → filter → score → sort pipeline and stores the result.
pub async fn find_candidates(
    state: &RouterState,
    req: &RouteRequest,
) -> Result<Vec<Candidate>, RouterError> {
    let config = state.config();
    let query = ModelQuery::parse(&req.model);
    let key = req.fingerprint();

    if let Some(cached) = state.cache.get(&key).await {
        if let Some(candidates) = revive_cached(state, &config, req, &cached).await {
            return Ok(candidates);
        }
        // Primary no longer eligible — treat as a miss and recompute.
    }

    let mut pairs = collect_matches(state, &config, &query);

    // Filters: cheap checks first, blacklist last (it takes a lock).
    let mut survivors: Vec<(String, String, ModelRecord)> = Vec::new();
    for (channel_id, model_id) in pairs.drain(..) {
        let Some(channel) = config.channel(&channel_id) else { continue };
        if !channel.enabled {
            continue;
        }
        if req.exclude_providers.contains(&channel.provider) {
            continue;
        }

        let record = state
            .catalog
            .record(&channel_id, &model_id)
            .unwrap_or_else(|| ModelRecord::new(&channel_id, &model_id));

        if config.routing.model_filters.exclude_embedding_models && !record.is_chat_suitable() {
            continue;
        }
        if !req.required_capabilities.is_empty()
            && !req.required_capabilities.iter().all(|c| record.capabilities.contains(c))
        {
            continue;
        }
        if let Some(ctx) = record.context_length {
            if ctx < req.min_context_length {
                continue;
            }
        }
        if let Some(min_params) = config.routing.model_filters.min_parameter_count {
            if record.parameter_count.is_some_and(|p| p < min_params) {
                continue;
            }
        }
        if state.blacklist.is_blocked(&channel_id, &model_id).await {
            continue;
        }

        survivors.push((channel_id, model_id, record));
    }

    let mut candidates: Vec<Candidate> = survivors
        .into_iter()
        .filter_map(|(channel_id, model_id, record)| {
            let channel = config.channel(&channel_id)?;
            let candidate = score_candidate(state, &config, channel, &model_id, &record, req);
            if let Some(cap) = req.max_cost_per_1k {
                if effective_cost_per_1k(state, &config, channel, &model_id, &record) > cap {
                    return None;
                }
            }
            Some(candidate)
        })
        .collect();

    // prefer_local: non-local candidates are dropped once any local survived.
    if req.prefer_local && candidates.iter().any(|c| c.score.local == 9) {
        candidates.retain(|c| c.score.local == 9);
    }

    // Strict free validation for `tag:free,...` expressions.
    if query.requires_free() {
        candidates.retain(|c| c.score.is_free());
    }

    // Budget guard: once the session's spend crosses the configured budget,
    // paid candidates are off the table.
    if let Some(budget) = config.cost_control.global_daily_budget {
        let spent = state.session.total_cost_usd();
        if config.cost_control.auto_disable_on_budget_exceeded && spent >= budget {
            tracing::warn!(spent, budget, "budget exhausted — paid candidates disabled");
            candidates.retain(|c| c.score.is_free());
        } else if let Some(threshold) = config.cost_control.alert_threshold {
            if spent >= budget * threshold {
                tracing::warn!(spent, budget, "spend crossed the alert threshold");
            }
        }
    }

    sort_candidates(&mut candidates);

    if candidates.is_empty() {
        return Err(RouterError::NoChannelsFound(req.model.clone()));
    }

    let backups: Vec<String> = candidates
        .iter()
        .skip(1)
        .take(crate::cache::MAX_BACKUPS)
        .map(|c| c.channel_id.clone())
        .collect();
    state
        .cache
        .insert(
            key,
            candidates[0].channel_id.clone(),
            candidates[0].model_id.clone(),
            backups,
            candidates[0].reason.clone(),
            candidates[0].est_cost_usd,
        )
        .await;

    Ok(candidates)
}

/// Rebuild a candidate list from a cached selection, or `None` when the
/// cached primary is no longer eligible (disabled or blacklisted).
async fn revive_cached(
    state: &RouterState,
    config: &Config,
    req: &RouteRequest,
    cached: &crate::cache::CachedSelection,
) -> Option<Vec<Candidate>> {
    let primary = config.channel(&cached.primary)?;
    if !primary.enabled
        || state.blacklist.is_blocked(&cached.primary, &cached.primary_model).await
    {
        return None;
    }

    let mut candidates = Vec::with_capacity(1 + cached.backups.len());
    for channel_id in std::iter::once(&cached.primary).chain(cached.backups.iter()) {
        let Some(channel) = config.channel(channel_id) else { continue };
        if !channel.enabled
            || state.blacklist.is_blocked(channel_id, &cached.primary_model).await
        {
            continue;
        }
        let record = state
            .catalog
            .record(channel_id, &cached.primary_model)
            .unwrap_or_else(|| ModelRecord::new(channel_id, &cached.primary_model));
        candidates.push(score_candidate(
            state,
            config,
            channel,
            &cached.primary_model,
            &record,
            req,
        ));
    }
    Some(candidates)
}

/// Union of physical and tag matches, deduplicated.
fn collect_matches(
    state: &RouterState,
    config: &Config,
    query: &ModelQuery,
) -> Vec<(String, String)> {
    let index = state.index();
    let mut seen = std::collections::BTreeSet::new();
    let mut pairs = Vec::new();
    let mut push = |channel_id: String, model_id: String| {
        if seen.insert((channel_id.clone(), model_id.clone())) {
            pairs.push((channel_id, model_id));
        }
    };

    match query {
        ModelQuery::Concrete(model_id) => {
            // Exact (channel, model) pairs first.
            for channel in config.channels.iter().filter(|c| c.enabled) {
                if channel.model == *model_id {
                    push(channel.id.clone(), model_id.clone());
                }
            }
            for record in state.catalog.all_records() {
                if record.model_id == *model_id {
                    push(record.channel_id, record.model_id);
                }
            }
            // Broaden through the model id's own tags.
            let derived: Vec<String> = tags::extract(model_id).into_iter().collect();
            if !derived.is_empty() {
                for hit in index.find(&derived, &[]) {
                    push(hit.channel_id, hit.model_id);
                }
            }
        }
        ModelQuery::Tags { positive, negative } => {
            for hit in index.find(positive, negative) {
                push(hit.channel_id, hit.model_id);
            }
        }
    }

    pairs
}

/// Effective per-1K cost used by the `max_cost_per_1k` filter: the midpoint
/// of prompt and completion prices, currency-adjusted.
fn effective_cost_per_1k(
    state: &RouterState,
    _config: &Config,
    channel: &ChannelConfig,
    model_id: &str,
    record: &ModelRecord,
) -> f64 {
    let resolved = state.pricing.resolve(
        &channel.provider,
        model_id,
        channel.cost_override(),
        record.pricing.as_ref(),
        0,
        0,
    );
    (resolved.prompt_per_token + resolved.completion_per_token) / 2.0 * 1000.0 * channel.fx_rate()
}

/// Score one eligible pair.
fn score_candidate(
    state: &RouterState,
    config: &Config,
    channel: &ChannelConfig,
    model_id: &str,
    record: &ModelRecord,
    req: &RouteRequest,
) -> Candidate {
    let est_completion = req.max_tokens.unwrap_or(1_024);
    let prompt_guess = cost::estimate_prompt_tokens(&req.messages, config.gateway.image_tokens);
    let resolved = state.pricing.resolve(
        &channel.provider,
        model_id,
        channel.cost_override(),
        record.pricing.as_ref(),
        prompt_guess,
        est_completion,
    );
    let estimate = cost::estimate(
        &req.messages,
        req.max_tokens,
        &resolved,
        channel.fx_rate(),
        config.gateway.image_tokens,
    );
    tracing::debug!(
        channel = %channel.id,
        model = %model_id,
        prompt_tokens = estimate.prompt_tokens,
        est_completion_tokens = estimate.est_completion_tokens,
        est_cost = %cost::format_usd(estimate.est_cost_usd),
        "scored candidate"
    );

    let zero_priced = resolved.prompt_per_token == 0.0
        && resolved.completion_per_token == 0.0
        && resolved.source != PriceSource::Estimated;
    let free_validated =
        (channel.has_tag("free") && zero_priced) || model_id.ends_with(":free");

    let is_local = config.is_local_channel(channel);
    let ema = state.stats.ema_latency_ms(&channel.id);

    let context = score::context_tier(record.context_length);
    let param = score::param_tier(record.parameter_count);
    let routing_score = RoutingScore {
        cost: score::cost_tier(estimate.est_cost_usd, free_validated),
        local: score::local_tier(is_local, ema),
        context,
        param,
        speed: score::speed_tier(ema),
        quality: score::quality_tier(param, context),
        reliability: score::reliability_tier(state.stats.success_rate(&channel.id)),
    };
    let sort_key = req.strategy.sort_key(&routing_score);

    let mut all_tags: std::collections::BTreeSet<String> = record.tags.clone();
    all_tags.extend(channel.tags.iter().map(|t| t.to_lowercase()));

    Candidate {
        channel_id: channel.id.clone(),
        channel_name: channel.name.clone(),
        provider: channel.provider.clone(),
        model_id: model_id.to_string(),
        reason: format!(
            "strategy={} score={} cost={}",
            req.strategy,
            routing_score,
            cost::format_usd(estimate.est_cost_usd)
        ),
        score: routing_score,
        sort_key,
        priority: channel.priority.unwrap_or(0),
        est_cost_usd: estimate.est_cost_usd,
        pricing_source: resolved.source,
        tags: all_tags.into_iter().collect(),
    }
}

/// Descending sort key, then configured priority, then channel id.
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.sort_key
            .cmp(&a.sort_key)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.channel_id.cmp(&b.channel_id))
    });
}
