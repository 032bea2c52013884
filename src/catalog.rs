//! The model catalog — what each channel's key can actually see.
//!
//! Discovery populates one [`KeyCatalog`] per (channel, api_key) pair, keyed
//! by `channel_id + "_" + first-8-hex-of-SHA256(api_key)`. Catalogs are never
//! shared across keys: two keys on the same provider can expose different
//! model lists and different pricing, and mixing them would corrupt both.

use std::{
    collections::{BTreeSet, HashMap},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{pricing::ModelPricing, tags};

/// Model capabilities the router can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FunctionCalling,
    Vision,
    Code,
    JsonMode,
    Thinking,
}

impl Capability {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function_calling" | "tools" => Some(Self::FunctionCalling),
            "vision" => Some(Self::Vision),
            "code" => Some(Self::Code),
            "json_mode" => Some(Self::JsonMode),
            "thinking" => Some(Self::Thinking),
            _ => None,
        }
    }
}

/// Heuristic account tier for a (channel, api_key) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Pro,
    Premium,
    #[default]
    Unknown,
}

/// One model as seen through one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub channel_id: String,
    pub model_id: String,
    pub context_length: Option<u64>,
    pub parameter_count: Option<u64>,
    pub capabilities: BTreeSet<Capability>,
    pub pricing: Option<ModelPricing>,
    pub tags: BTreeSet<String>,
}

impl ModelRecord {
    pub fn new(channel_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        let model_id = model_id.into();
        let tags = tags::extract(&model_id);
        Self {
            channel_id,
            model_id,
            context_length: None,
            parameter_count: None,
            capabilities: BTreeSet::new(),
            pricing: None,
            tags,
        }
    }

    /// Whether the model is chat-suitable: embeddings, audio, and image
    /// generation models carry disqualifying markers in their tags.
    pub fn is_chat_suitable(&self) -> bool {
        const NON_CHAT_MARKERS: &[&str] = &[
            "embedding",
            "embed",
            "rerank",
            "reranker",
            "whisper",
            "tts",
            "audio",
            "speech",
            "dalle",
            "flux",
            "diffusion",
            "upscale",
        ];
        !self
            .tags
            .iter()
            .any(|t| NON_CHAT_MARKERS.contains(&t.as_str()))
    }
}

/// The model list one API key exposes on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCatalog {
    pub cache_key: String,
    pub channel_id: String,
    pub api_key_hash: String,
    pub user_tier: UserTier,
    pub models: Vec<ModelRecord>,
    pub last_updated: DateTime<Utc>,
}

/// Discovery cache key: `channel_id + "_" + first-8-hex-of-SHA256(api_key)`.
pub fn discovery_cache_key(channel_id: &str, api_key: &str) -> String {
    format!("{channel_id}_{}", api_key_hash(api_key))
}

/// First 8 hex chars of the key's SHA-256 — enough to tell keys apart without
/// ever storing the key itself.
pub fn api_key_hash(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Classify the account tier behind a discovered model list.
///
/// A `Pro/` model family marks pro accounts outright (SiliconFlow-style);
/// otherwise the sheer catalog size is the signal (OpenRouter-style).
pub fn classify_user_tier(model_ids: &[&str]) -> UserTier {
    if model_ids.is_empty() {
        return UserTier::Unknown;
    }
    if model_ids.iter().any(|id| id.starts_with("Pro/")) {
        return UserTier::Pro;
    }
    match model_ids.len() {
        n if n > 100 => UserTier::Premium,
        n if n > 50 => UserTier::Pro,
        _ => UserTier::Free,
    }
}

/// Process-wide catalog: per-key snapshots plus merged lookups.
///
/// Reads happen on the request path, writes only from discovery, so a plain
/// `RwLock` with short critical sections is enough.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    by_key: RwLock<HashMap<String, KeyCatalog>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the catalog for one (channel, key) pair.
    pub fn update_key(&self, catalog: KeyCatalog) {
        let mut by_key = self.by_key.write().expect("catalog lock poisoned");
        by_key.insert(catalog.cache_key.clone(), catalog);
    }

    /// The record for a (channel, model) pair, if any key on that channel
    /// exposes it. When several keys do, the most recently updated one wins.
    pub fn record(&self, channel_id: &str, model_id: &str) -> Option<ModelRecord> {
        let by_key = self.by_key.read().expect("catalog lock poisoned");
        by_key
            .values()
            .filter(|kc| kc.channel_id == channel_id)
            .max_by_key(|kc| kc.last_updated)
            .and_then(|kc| kc.models.iter().find(|m| m.model_id == model_id))
            .cloned()
    }

    /// Pricing discovered for a (channel, model) pair with that channel's key.
    pub fn discovered_pricing(&self, channel_id: &str, model_id: &str) -> Option<ModelPricing> {
        self.record(channel_id, model_id).and_then(|r| r.pricing)
    }

    /// All (channel, model) pairs across all keys, deduplicated.
    pub fn entries(&self) -> Vec<(String, String)> {
        let by_key = self.by_key.read().expect("catalog lock poisoned");
        let mut set: BTreeSet<(String, String)> = BTreeSet::new();
        for kc in by_key.values() {
            for m in &kc.models {
                set.insert((m.channel_id.clone(), m.model_id.clone()));
            }
        }
        set.into_iter().collect()
    }

    /// All records for every channel, deduplicated by (channel, model).
    pub fn all_records(&self) -> Vec<ModelRecord> {
        let by_key = self.by_key.read().expect("catalog lock poisoned");
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        let mut out = Vec::new();
        let mut catalogs: Vec<&KeyCatalog> = by_key.values().collect();
        catalogs.sort_by_key(|kc| std::cmp::Reverse(kc.last_updated));
        for kc in catalogs {
            for m in &kc.models {
                if seen.insert((m.channel_id.clone(), m.model_id.clone())) {
                    out.push(m.clone());
                }
            }
        }
        out
    }

    /// Per-key summaries for the admin stats endpoint.
    pub fn key_summaries(&self) -> Vec<serde_json::Value> {
        let by_key = self.by_key.read().expect("catalog lock poisoned");
        let mut rows: Vec<serde_json::Value> = by_key
            .values()
            .map(|kc| {
                serde_json::json!({
                    "cache_key": kc.cache_key,
                    "channel_id": kc.channel_id,
                    "api_key_hash": kc.api_key_hash,
                    "user_tier": kc.user_tier,
                    "model_count": kc.models.len(),
                    "last_updated": kc.last_updated,
                })
            })
            .collect();
        rows.sort_by_key(|r| r["cache_key"].as_str().map(String::from));
        rows
    }
}
