//! Failover execution — the routing pipeline's back half.
//!
//! Takes the ordered candidate list from the finder and tries each in turn
//! with a bounded attempt budget. Failures are classified, recorded against
//! the blacklist and rolling stats, and the next candidate is tried. A
//! pre-flight blacklist re-check (and the daily-cap check) skips candidates
//! without spending attempts.
//!
//! Streaming requests commit to a candidate once upstream headers arrive:
//! after the first byte has reached the client, failover is no longer
//! possible and mid-stream errors surface as a terminal SSE error event.

use chrono::{NaiveTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    adapters::{AdapterClient, SseStream},
    config::{ChannelConfig, Config},
    error::{ErrorKind, RouterError},
    finder::{Candidate, RouteRequest},
    state::RouterState,
};

/// Router extension fields stripped from the body before it goes upstream.
const EXTENSION_FIELDS: &[&str] = &[
    "strategy",
    "required_capabilities",
    "exclude_providers",
    "prefer_local",
    "min_context_length",
    "max_cost_per_1k",
];

/// What the winning attempt looked like, for the response aggregator.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub candidate: Candidate,
    /// Counted attempts including the winning one.
    pub attempts: u32,
    /// End-to-end latency for buffered responses; time-to-first-byte for streams.
    pub latency_ms: u64,
}

/// Execute a buffered request against the candidate list.
pub async fn execute(
    state: &RouterState,
    req: &RouteRequest,
    body: &Value,
    candidates: Vec<Candidate>,
) -> Result<(Value, RouteOutcome), RouterError> {
    let config = state.config();
    let max_attempts = max_attempts(&config);
    let deadline = request_deadline(&config);
    let started = std::time::Instant::now();
    let mut attempts: u32 = 0;
    let mut worst: Option<(ErrorKind, String)> = None;

    for candidate in candidates {
        if attempts >= max_attempts {
            break;
        }
        if started.elapsed() >= deadline {
            warn!(attempts, "request deadline exceeded before all candidates were tried");
            break;
        }
        let Some((channel, client)) = preflight(state, &config, &candidate).await else {
            continue; // skipped, not counted
        };

        attempts += 1;
        state.daily.increment(&channel.id);
        let upstream_body = prepare_body(body, &candidate, false);

        debug!(channel = %candidate.channel_id, model = %candidate.model_id, attempt = attempts, "dispatching");
        let t0 = std::time::Instant::now();
        match client.chat(upstream_body).await {
            Ok(response) => {
                let latency_ms = t0.elapsed().as_millis() as u64;
                state.blacklist.record_success(&candidate.channel_id, &candidate.model_id).await;
                state.stats.record(&candidate.channel_id, latency_ms, true);
                return Ok((response, RouteOutcome { candidate, attempts, latency_ms }));
            }
            Err(e) => {
                let latency_ms = t0.elapsed().as_millis() as u64;
                record_failure(state, &candidate, &e, latency_ms).await;
                track_worst(&mut worst, e.kind(), e.to_string());
                if !config.routing.enable_fallback {
                    break;
                }
            }
        }
    }

    Err(exhausted(req, attempts, worst))
}

/// Execute a streaming request. Failover applies only until upstream headers
/// arrive; the returned stream belongs to the winning candidate.
pub async fn execute_stream(
    state: &RouterState,
    req: &RouteRequest,
    body: &Value,
    candidates: Vec<Candidate>,
) -> Result<(SseStream, RouteOutcome), RouterError> {
    let config = state.config();
    let max_attempts = max_attempts(&config);
    let deadline = request_deadline(&config);
    let started = std::time::Instant::now();
    let mut attempts: u32 = 0;
    let mut worst: Option<(ErrorKind, String)> = None;

    for candidate in candidates {
        if attempts >= max_attempts {
            break;
        }
        if started.elapsed() >= deadline {
            warn!(attempts, "request deadline exceeded before all candidates were tried");
            break;
        }
        let Some((channel, client)) = preflight(state, &config, &candidate).await else {
            continue;
        };

        attempts += 1;
        state.daily.increment(&channel.id);
        let upstream_body = prepare_body(body, &candidate, true);

        debug!(channel = %candidate.channel_id, model = %candidate.model_id, attempt = attempts, "streaming dispatch");
        let t0 = std::time::Instant::now();
        match client.chat_stream(upstream_body).await {
            Ok(stream) => {
                // Latency here is time-to-first-byte (connection + headers).
                let latency_ms = t0.elapsed().as_millis() as u64;
                state.blacklist.record_success(&candidate.channel_id, &candidate.model_id).await;
                state.stats.record(&candidate.channel_id, latency_ms, true);
                return Ok((stream, RouteOutcome { candidate, attempts, latency_ms }));
            }
            Err(e) => {
                let latency_ms = t0.elapsed().as_millis() as u64;
                record_failure(state, &candidate, &e, latency_ms).await;
                track_worst(&mut worst, e.kind(), e.to_string());
                if !config.routing.enable_fallback {
                    break;
                }
            }
        }
    }

    Err(exhausted(req, attempts, worst))
}

fn max_attempts(config: &Config) -> u32 {
    config.routing.max_retry_attempts.max(1)
}

fn request_deadline(config: &Config) -> std::time::Duration {
    std::time::Duration::from_secs(config.routing.request_timeout_seconds.max(1))
}

/// Eligibility re-check at attempt time: the blacklist may have changed since
/// the finder ran, and daily caps are enforced here. Skips never count
/// against the attempt budget.
async fn preflight<'a>(
    state: &RouterState,
    config: &'a Config,
    candidate: &Candidate,
) -> Option<(&'a ChannelConfig, AdapterClient)> {
    if state.blacklist.is_blocked(&candidate.channel_id, &candidate.model_id).await {
        debug!(channel = %candidate.channel_id, model = %candidate.model_id, "skipping blacklisted candidate");
        return None;
    }

    let channel = config.channel(&candidate.channel_id)?;
    if !channel.enabled {
        return None;
    }

    if let Some(limit) = channel.daily_request_limit {
        if state.daily.today(&channel.id) >= limit {
            let midnight = next_utc_midnight();
            warn!(channel = %channel.id, limit, "daily request cap reached — parking channel until midnight UTC");
            state.blacklist.block_channel_until(&channel.id, midnight).await;
            state.cache.invalidate_channel(&channel.id).await;
            return None;
        }
    }

    let provider = config.provider_of(channel)?;
    match AdapterClient::new(provider, channel) {
        Ok(client) => Some((channel, client)),
        Err(e) => {
            warn!(channel = %channel.id, error = %e, "skipping candidate — client build failed");
            None
        }
    }
}

/// Rewrite the outbound body for one candidate: bind the model, set the
/// stream flag, drop router extension fields.
fn prepare_body(body: &Value, candidate: &Candidate, stream: bool) -> Value {
    let mut out = body.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("model".into(), Value::String(candidate.model_id.clone()));
        obj.insert("stream".into(), Value::Bool(stream));
        for field in EXTENSION_FIELDS {
            obj.remove(*field);
        }
    }
    out
}

async fn record_failure(
    state: &RouterState,
    candidate: &Candidate,
    error: &crate::error::UpstreamError,
    latency_ms: u64,
) {
    let kind = error.kind();
    warn!(
        channel = %candidate.channel_id,
        model = %candidate.model_id,
        kind = %kind,
        error = %error,
        "attempt failed"
    );
    state.stats.record(&candidate.channel_id, latency_ms, false);
    state
        .blacklist
        .record_failure(&candidate.channel_id, &candidate.model_id, kind)
        .await;
    if kind.is_channel_wide() {
        let removed = state.cache.invalidate_channel(&candidate.channel_id).await;
        debug!(channel = %candidate.channel_id, removed, "cache entries invalidated after auth failure");
    }
}

fn track_worst(worst: &mut Option<(ErrorKind, String)>, kind: ErrorKind, message: String) {
    let replace = worst
        .as_ref()
        .map_or(true, |(current, _)| kind.severity() > current.severity());
    if replace {
        *worst = Some((kind, message));
    }
}

fn exhausted(req: &RouteRequest, attempts: u32, worst: Option<(ErrorKind, String)>) -> RouterError {
    match worst {
        Some((kind, last_error)) => RouterError::AllChannelsFailed { worst: kind, attempts, last_error },
        // Every candidate was skipped pre-flight — nothing was attempted.
        None => RouterError::NoChannelsFound(req.model.clone()),
    }
}

fn next_utc_midnight() -> chrono::DateTime<Utc> {
    let today = Utc::now().date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}
