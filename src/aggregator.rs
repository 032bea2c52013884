//! Response aggregation — per-request routing metadata.
//!
//! Every response the gateway returns carries a `smart_ai_router` block:
//! which channel won, why, how many attempts it took, what it cost, and the
//! running session totals. Buffered responses get an extra top-level JSON
//! field; streams get one extra SSE event carrying the same block, emitted
//! exactly once and always before the terminal `data: [DONE]` sentinel.

use std::{convert::Infallible, pin::Pin, sync::Arc};

use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde_json::{json, Value};

use crate::{
    adapters::SseStream,
    cost,
    failover::RouteOutcome,
    finder::RouteRequest,
    pricing::ResolvedPricing,
    state::RouterState,
};

/// The stream shape handed to the HTTP layer: mid-stream upstream errors are
/// rendered as SSE events, so the transport never sees an error item.
pub type ClientStream = Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>;

/// Everything the aggregator knows about one request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub model_requested: String,
    pub model_used: String,
    pub channel_id: String,
    pub channel_name: String,
    pub provider: String,
    pub strategy: String,
    pub score: String,
    pub selection_reason: String,
    pub pricing_source: String,
    pub tags: Vec<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    pub ttfb_ms: Option<u64>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub error: Option<String>,
}

impl RequestMeta {
    /// Seed the metadata from the routing outcome. Token and cost fields are
    /// filled in at finalization.
    pub fn from_outcome(request_id: String, req: &RouteRequest, outcome: &RouteOutcome) -> Self {
        Self {
            request_id,
            model_requested: req.model.clone(),
            model_used: outcome.candidate.model_id.clone(),
            channel_id: outcome.candidate.channel_id.clone(),
            channel_name: outcome.candidate.channel_name.clone(),
            provider: outcome.candidate.provider.clone(),
            strategy: req.strategy.to_string(),
            score: outcome.candidate.score.to_string(),
            selection_reason: outcome.candidate.reason.clone(),
            pricing_source: outcome.candidate.pricing_source.to_string(),
            tags: outcome.candidate.tags.clone(),
            attempts: outcome.attempts,
            latency_ms: outcome.latency_ms,
            ttfb_ms: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            error: None,
        }
    }

    /// The `smart_ai_router` block.
    pub fn to_json(&self, session_requests: u64, session_cost_usd: f64) -> Value {
        let mut block = json!({
            "request_id": self.request_id,
            "routing": {
                "model_requested": self.model_requested,
                "model_used": self.model_used,
                "channel_id": self.channel_id,
                "channel_name": self.channel_name,
                "provider": self.provider,
                "strategy": self.strategy,
                "score": self.score,
                "selection_reason": self.selection_reason,
                "pricing_source": self.pricing_source,
                "tags": self.tags,
            },
            "performance": {
                "latency_ms": self.latency_ms,
                "ttfb_ms": self.ttfb_ms,
                "attempts": self.attempts,
            },
            "tokens": {
                "prompt": self.prompt_tokens,
                "completion": self.completion_tokens,
                "total": self.prompt_tokens + self.completion_tokens,
            },
            "cost": {
                "request": {
                    "total_cost": cost::format_usd(self.cost_usd),
                    "currency": "USD",
                },
                "session": {
                    "total_requests": session_requests,
                    "total_cost": cost::format_usd(session_cost_usd),
                },
            },
        });
        if let Some(error) = &self.error {
            block["error"] = Value::String(error.clone());
        }
        block
    }

    /// `X-Router-*` response headers. The request-id header is owned by the
    /// request-id middleware.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-router-channel", self.channel_id.clone()),
            ("x-router-provider", self.provider.clone()),
            ("x-router-strategy", self.strategy.clone()),
            ("x-router-score", self.score.clone()),
            ("x-router-attempts", self.attempts.to_string()),
            ("x-router-time", self.latency_ms.to_string()),
        ]
    }
}

/// Finalize a buffered response: compute the real cost from upstream usage
/// (falling back to the estimate), bump session totals, and inject the
/// `smart_ai_router` block. The OpenAI-shaped fields are untouched.
pub fn finalize_buffered(
    state: &RouterState,
    response: &mut Value,
    meta: &mut RequestMeta,
    est_prompt_tokens: u64,
    pricing: &ResolvedPricing,
    fx_rate: f64,
) {
    let prompt_tokens = response
        .pointer("/usage/prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(est_prompt_tokens);
    let completion_tokens = response
        .pointer("/usage/completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let final_cost = cost::finalize(prompt_tokens, completion_tokens, pricing, fx_rate);
    meta.prompt_tokens = final_cost.prompt_tokens;
    meta.completion_tokens = final_cost.completion_tokens;
    meta.cost_usd = final_cost.cost_usd;
    state.session.record(final_cost.cost_usd);

    if let Some(obj) = response.as_object_mut() {
        obj.insert(
            "smart_ai_router".to_string(),
            meta.to_json(state.session.total_requests(), state.session.total_cost_usd()),
        );
    }
}

/// Wrap an adapter stream for delivery to the client.
///
/// Chunks are forwarded untouched while the wrapper tracks time-to-first-byte,
/// accumulates completion size, and captures upstream usage counts when a
/// chunk carries them. At end of stream it emits exactly one aggregator event
/// and then `data: [DONE]`. A mid-stream upstream error becomes an aggregator
/// event with `error` set, after which the stream closes without the sentinel.
pub fn finalize_stream(
    state: Arc<RouterState>,
    inner: SseStream,
    mut meta: RequestMeta,
    est_prompt_tokens: u64,
    pricing: ResolvedPricing,
    fx_rate: f64,
) -> ClientStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    let started = std::time::Instant::now();

    tokio::spawn(async move {
        let mut inner = inner;
        let mut completion_chars: u64 = 0;
        let mut usage_prompt: Option<u64> = None;
        let mut usage_completion: Option<u64> = None;
        let mut aborted = false;

        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    if meta.ttfb_ms.is_none() {
                        meta.ttfb_ms = Some(started.elapsed().as_millis() as u64);
                    }
                    observe_chunk(&chunk, &mut completion_chars, &mut usage_prompt, &mut usage_completion);
                    if tx.send(chunk).await.is_err() {
                        return; // client disconnected — drop upstream, no failover
                    }
                }
                Err(e) => {
                    let err = crate::error::RouterError::StreamAborted(e.to_string());
                    tracing::warn!(error = %err, "stream aborted mid-flight");
                    meta.error = Some(err.to_string());
                    aborted = true;
                    break;
                }
            }
        }

        let prompt_tokens = usage_prompt.unwrap_or(est_prompt_tokens);
        let completion_tokens = usage_completion
            .unwrap_or_else(|| (completion_chars as f64 / 2.5).ceil() as u64);
        let final_cost = cost::finalize(prompt_tokens, completion_tokens, &pricing, fx_rate);
        meta.prompt_tokens = final_cost.prompt_tokens;
        meta.completion_tokens = final_cost.completion_tokens;
        meta.cost_usd = final_cost.cost_usd;
        meta.latency_ms = started.elapsed().as_millis() as u64;
        state.session.record(final_cost.cost_usd);

        let terminal = json!({
            "id": meta.request_id,
            "object": "chat.completion.chunk",
            "choices": [{ "index": 0, "delta": {}, "finish_reason": null }],
            "smart_ai_router": meta.to_json(
                state.session.total_requests(),
                state.session.total_cost_usd(),
            ),
        });
        if tx.send(Bytes::from(format!("data: {terminal}\n\n"))).await.is_err() {
            return;
        }
        if !aborted {
            let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
        }
    });

    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    }))
}

/// Pull delta text length and usage counts out of one SSE event.
fn observe_chunk(
    chunk: &Bytes,
    completion_chars: &mut u64,
    usage_prompt: &mut Option<u64>,
    usage_completion: &mut Option<u64>,
) {
    let Ok(text) = std::str::from_utf8(chunk) else { return };
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
        if let Some(content) = event.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            *completion_chars += content.chars().count() as u64;
        }
        if let Some(p) = event.pointer("/usage/prompt_tokens").and_then(Value::as_u64) {
            *usage_prompt = Some(p);
        }
        if let Some(c) = event.pointer("/usage/completion_tokens").and_then(Value::as_u64) {
            *usage_completion = Some(c);
        }
    }
}
