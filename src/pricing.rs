//! Pricing store — per-provider static pricing with tiered fallback.
//!
//! Resolution order for a (channel, model) pair:
//!
//! 1. per-channel cost override from the config
//! 2. pricing discovered with that channel's own API key
//! 3. the provider's static pricing file entry
//! 4. the provider's tiered-pricing ladder (input-token range, then output band)
//! 5. a generic estimate, flagged as such
//!
//! The winning source is reported back so the response aggregator can expose
//! where a quoted price came from.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Generic fallback: $0.001 / 1K prompt tokens.
const DEFAULT_PROMPT_PER_TOKEN: f64 = 0.001 / 1000.0;
/// Generic fallback: $0.002 / 1K completion tokens.
const DEFAULT_COMPLETION_PER_TOKEN: f64 = 0.002 / 1000.0;

/// Where a resolved price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    ChannelOverride,
    Discovered,
    Static,
    Tiered,
    /// Generic fallback — the price is an estimate, not a quote.
    Estimated,
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ChannelOverride => "channel_override",
            Self::Discovered => "discovered",
            Self::Static => "static",
            Self::Tiered => "tiered",
            Self::Estimated => "estimated",
        })
    }
}

/// Per-token pricing attached to a discovered model record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_token: f64,
    pub completion_per_token: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// A fully resolved price, including its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPricing {
    pub prompt_per_token: f64,
    pub completion_per_token: f64,
    pub currency: String,
    pub source: PriceSource,
}

/// One model's entry in the static pricing file.
///
/// Readers tolerate extra fields and missing optional ones — the file schema
/// is collaborator-managed and evolves independently.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticModelPricing {
    pub prompt_per_token: f64,
    pub completion_per_token: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// One rung of a tiered-pricing ladder. The first rule whose `input_range`
/// contains the prompt-token count wins; the completion price then comes from
/// the first output band whose ceiling covers the completion-token count.
#[derive(Debug, Clone, Deserialize)]
pub struct TieredRule {
    /// Inclusive `[min, max]` prompt-token range.
    pub input_range: [u64; 2],
    pub prompt_per_token: f64,
    pub output_bands: Vec<OutputBand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputBand {
    /// Band applies while completion tokens are at or under this ceiling.
    pub max_output_tokens: u64,
    pub completion_per_token: f64,
}

/// Static pricing data for one provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPricing {
    #[serde(default)]
    pub models: HashMap<String, StaticModelPricing>,
    #[serde(default)]
    pub tiered: Vec<TieredRule>,
}

/// The pricing store: provider-keyed static tables plus the resolution logic.
#[derive(Debug, Default)]
pub struct PricingStore {
    providers: HashMap<String, ProviderPricing>,
}

#[derive(Debug, Deserialize)]
struct PricingFile {
    #[serde(default)]
    providers: HashMap<String, ProviderPricing>,
}

impl PricingStore {
    /// A store with no static data. Resolution falls through to discovered
    /// pricing and the generic estimate.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the static pricing file (JSON, §6.3-tolerant schema).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pricing file {}", path.display()))?;
        let file: PricingFile =
            serde_json::from_str(&content).context("parsing pricing file JSON")?;
        Ok(Self { providers: file.providers })
    }

    pub fn static_entry(&self, provider: &str, model_id: &str) -> Option<&StaticModelPricing> {
        self.providers.get(provider)?.models.get(model_id)
    }

    /// Resolve the effective price for a (provider, model) pair.
    ///
    /// `channel_override` is the channel's configured per-1K cost pair,
    /// `discovered` is pricing fetched with the channel's own key. Token
    /// counts only matter when the provider prices by tier.
    pub fn resolve(
        &self,
        provider: &str,
        model_id: &str,
        channel_override: Option<(f64, f64)>,
        discovered: Option<&ModelPricing>,
        est_prompt_tokens: u64,
        est_completion_tokens: u64,
    ) -> ResolvedPricing {
        if let Some((prompt_per_1k, completion_per_1k)) = channel_override {
            return ResolvedPricing {
                prompt_per_token: prompt_per_1k / 1000.0,
                completion_per_token: completion_per_1k / 1000.0,
                currency: default_currency(),
                source: PriceSource::ChannelOverride,
            };
        }

        if let Some(p) = discovered {
            return ResolvedPricing {
                prompt_per_token: p.prompt_per_token,
                completion_per_token: p.completion_per_token,
                currency: p.currency.clone(),
                source: PriceSource::Discovered,
            };
        }

        if let Some(entry) = self.static_entry(provider, model_id) {
            return ResolvedPricing {
                prompt_per_token: entry.prompt_per_token,
                completion_per_token: entry.completion_per_token,
                currency: entry.currency.clone(),
                source: PriceSource::Static,
            };
        }

        if let Some(rules) = self.providers.get(provider).map(|p| &p.tiered) {
            if let Some(priced) = evaluate_tiered(rules, est_prompt_tokens, est_completion_tokens) {
                return priced;
            }
        }

        ResolvedPricing {
            prompt_per_token: DEFAULT_PROMPT_PER_TOKEN,
            completion_per_token: DEFAULT_COMPLETION_PER_TOKEN,
            currency: default_currency(),
            source: PriceSource::Estimated,
        }
    }
}

/// First matching input range wins; the output band is the first whose
/// ceiling covers the completion count, falling back to the last band.
fn evaluate_tiered(
    rules: &[TieredRule],
    prompt_tokens: u64,
    completion_tokens: u64,
) -> Option<ResolvedPricing> {
    let rule = rules
        .iter()
        .find(|r| prompt_tokens >= r.input_range[0] && prompt_tokens <= r.input_range[1])?;

    let band = rule
        .output_bands
        .iter()
        .find(|b| completion_tokens <= b.max_output_tokens)
        .or_else(|| rule.output_bands.last())?;

    Some(ResolvedPricing {
        prompt_per_token: rule.prompt_per_token,
        completion_per_token: band.completion_per_token,
        currency: default_currency(),
        source: PriceSource::Tiered,
    })
}
