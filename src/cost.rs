//! Token and cost estimation.
//!
//! No tokenizer dependency: the portable baseline is character count divided
//! by 2.5, which tracks real tokenizers closely enough for routing decisions.
//! When an upstream reports exact usage, [`finalize`] prefers it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::pricing::ResolvedPricing;

/// Characters per token for the baseline estimator.
const CHARS_PER_TOKEN: f64 = 2.5;
/// Assumed completion size when the caller sets no `max_tokens`.
const DEFAULT_EST_COMPLETION_TOKENS: u64 = 1_024;

/// Pre-selection estimate: completion cost is an upper bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub prompt_tokens: u64,
    pub est_completion_tokens: u64,
    pub est_cost_usd: f64,
}

/// Post-hoc cost from observed usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

/// Estimate prompt tokens for an OpenAI-shaped `messages` array.
///
/// Text contributes `ceil(chars / 2.5)` (floored at 1); each image part
/// contributes a flat `image_tokens`.
pub fn estimate_prompt_tokens(messages: &[Value], image_tokens: u64) -> u64 {
    let mut chars: usize = 0;
    let mut images: u64 = 0;

    for message in messages {
        match message.get("content") {
            Some(Value::String(text)) => chars += text.chars().count(),
            Some(Value::Array(parts)) => {
                for part in parts {
                    match part.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                chars += text.chars().count();
                            }
                        }
                        Some("image_url") | Some("image") => images += 1,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let text_tokens = ((chars as f64) / CHARS_PER_TOKEN).ceil() as u64;
    text_tokens.max(1) + images * image_tokens
}

/// Pre-selection cost estimate for a request against a priced channel.
///
/// `fx_rate` is the channel's currency multiplier (1.0 when absent).
pub fn estimate(
    messages: &[Value],
    max_tokens: Option<u64>,
    pricing: &ResolvedPricing,
    fx_rate: f64,
    image_tokens: u64,
) -> CostEstimate {
    let prompt_tokens = estimate_prompt_tokens(messages, image_tokens);
    let est_completion_tokens = max_tokens.unwrap_or(DEFAULT_EST_COMPLETION_TOKENS);
    let est_cost_usd = (prompt_tokens as f64 * pricing.prompt_per_token
        + est_completion_tokens as f64 * pricing.completion_per_token)
        * fx_rate;
    CostEstimate { prompt_tokens, est_completion_tokens, est_cost_usd }
}

/// Post-hoc cost from observed completion tokens.
pub fn finalize(
    prompt_tokens: u64,
    completion_tokens: u64,
    pricing: &ResolvedPricing,
    fx_rate: f64,
) -> FinalCost {
    let cost_usd = (prompt_tokens as f64 * pricing.prompt_per_token
        + completion_tokens as f64 * pricing.completion_per_token)
        * fx_rate;
    FinalCost { prompt_tokens, completion_tokens, cost_usd }
}

/// Render a USD amount the way the aggregator reports it.
pub fn format_usd(amount: f64) -> String {
    format!("${amount:.6}")
}

/// Process-wide running totals. Lifecycle matches the process; atomic so the
/// request path never contends with the admin endpoint reading them.
///
/// Cost is stored in micro-dollars to stay in integer atomics.
#[derive(Debug, Default)]
pub struct SessionTotals {
    requests: AtomicU64,
    micro_usd: AtomicU64,
}

impl SessionTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cost_usd: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let micro = (cost_usd.max(0.0) * 1_000_000.0).round() as u64;
        self.micro_usd.fetch_add(micro, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.micro_usd.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}
