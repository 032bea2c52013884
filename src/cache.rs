//! Request-level routing cache.
//!
//! Routing a request is pure with respect to everything *except* message
//! content, so the selection for a given routing shape can be reused. The key
//! is a 32-hex-char fingerprint over the routing-relevant request fields —
//! message content is deliberately excluded. Entries carry the winning
//! channel plus up to five backups and expire after a short TTL.
//!
//! Invalidation is channel-targeted: when a channel fails hard, every entry
//! naming it (as primary or backup) is dropped at once.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use serde_json::json;
use tokio::sync::Mutex;

/// Maximum number of backup channels stored per entry.
pub const MAX_BACKUPS: usize = 5;

/// The routing-relevant shape of a request. Hashing this — not the messages —
/// is what lets two requests with different content share a selection.
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    pub model: &'a str,
    pub strategy: &'a str,
    pub required_capabilities: &'a [String],
    pub exclude_providers: &'a [String],
    pub min_context_length: u64,
    pub max_cost_per_1k: Option<f64>,
    pub prefer_local: bool,
    pub has_functions: bool,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

/// Compute the 32-hex-char fingerprint.
///
/// The tuple is serialized as canonical JSON (serde_json orders object keys),
/// list fields are sorted, and `max_tokens` / `temperature` are bucketed so
/// near-identical requests land on the same entry.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let mut capabilities: Vec<&String> = input.required_capabilities.iter().collect();
    capabilities.sort();
    let mut excluded: Vec<&String> = input.exclude_providers.iter().collect();
    excluded.sort();

    let canonical = json!({
        "capabilities": capabilities,
        "exclude_providers": excluded,
        "has_functions": input.has_functions,
        "max_cost_per_1k": input.max_cost_per_1k,
        "max_tokens_bucket": input.max_tokens.map(|t| t / 256),
        "min_context_length": input.min_context_length,
        "model": input.model,
        "prefer_local": input.prefer_local,
        "strategy": input.strategy,
        "stream": input.stream,
        "temperature_bucket": input.temperature.map(|t| (t * 10.0).round() as i64),
    });

    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// A cached routing selection.
#[derive(Debug, Clone, Serialize)]
pub struct CachedSelection {
    pub primary: String,
    pub primary_model: String,
    pub backups: Vec<String>,
    pub reason: String,
    pub est_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_used_at: DateTime<Utc>,
}

impl CachedSelection {
    fn references(&self, channel_id: &str) -> bool {
        self.primary == channel_id || self.backups.iter().any(|b| b == channel_id)
    }
}

/// Counters exposed through `/admin/cache/stats`.
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub size: usize,
    pub max_entries: usize,
    pub hit_rate: f64,
}

/// Fingerprint → selection map with TTL, LRU eviction, and channel-targeted
/// invalidation. All mutation goes through one mutex; the critical sections
/// are map operations only.
pub struct RequestCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedSelection>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl RequestCache {
    pub fn new(ttl_seconds: i64, max_entries: usize) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds),
            max_entries,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint. Expired entries are removed on read and count
    /// as misses; hits bump `hit_count` and the LRU timestamp.
    pub async fn get(&self, key: &str) -> Option<CachedSelection> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.hit_count += 1;
                entry.last_used_at = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a selection. Backups beyond [`MAX_BACKUPS`] are truncated; the
    /// least-recently-used entry is evicted when the cache is full.
    pub async fn insert(
        &self,
        key: String,
        primary: String,
        primary_model: String,
        mut backups: Vec<String>,
        reason: String,
        est_cost_usd: f64,
    ) {
        backups.truncate(MAX_BACKUPS);
        let now = Utc::now();
        let entry = CachedSelection {
            primary,
            primary_model,
            backups,
            reason,
            est_cost_usd,
            created_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
            last_used_at: now,
        };

        let mut entries = self.entries.lock().await;
        entries.insert(key, entry);
        if entries.len() > self.max_entries {
            Self::evict_lru(&mut entries, self.max_entries);
        }
    }

    /// Drop every entry whose primary or backups mention `channel_id`.
    /// Returns how many entries were removed.
    pub async fn invalidate_channel(&self, channel_id: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.references(channel_id));
        let removed = before - entries.len();
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Periodic sweep: drop expired entries, then LRU-evict down to capacity.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() > self.max_entries {
            Self::evict_lru(&mut entries, self.max_entries);
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let size = self.entries.lock().await.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size,
            max_entries: self.max_entries,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    fn evict_lru(entries: &mut HashMap<String, CachedSelection>, target: usize) {
        while entries.len() > target {
            let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(k, _)| k.clone())
            else {
                return;
            };
            entries.remove(&oldest_key);
        }
    }
}
