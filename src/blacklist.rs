//! Failure blacklist with model-scoped cooldowns.
//!
//! Most failures poison only the (channel, model) pair that produced them,
//! with an exponential cooldown. Auth-fatal failures poison the whole channel
//! (`*` scope) indefinitely — only a successful health reset or an operator
//! clears them. Daily-cap exhaustion also lands here, scoped to the channel
//! until the next UTC midnight.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::ErrorKind;

/// Scope marker for channel-wide entries.
pub const WILDCARD_MODEL: &str = "*";

/// Base cooldown for the exponential backoff ladder.
const BASE_DELAY_SECS: i64 = 30;
/// Ceiling for the exponential backoff ladder.
const MAX_BACKOFF_SECS: i64 = 300;
/// Cooldown for model-not-found: the catalog is stale, not flaky.
const MODEL_NOT_FOUND_SECS: i64 = 3_600;
/// Cooldown for unclassified failures.
const UNKNOWN_SECS: i64 = 60;

/// One blacklist entry. `blacklisted_until == None` means indefinite.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntry {
    pub channel_id: String,
    pub model_id: String,
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub last_error_kind: ErrorKind,
}

impl BlacklistEntry {
    fn blocks_at(&self, now: DateTime<Utc>) -> bool {
        match self.blacklisted_until {
            None => true,
            Some(until) => until > now,
        }
    }
}

/// Cooldown for a failure of `kind` after `failure_count` consecutive failures.
/// `None` means indefinite (auth-fatal).
pub fn cooldown(kind: ErrorKind, failure_count: u32) -> Option<Duration> {
    match kind {
        ErrorKind::AuthFatal => None,
        ErrorKind::ModelNotFound => Some(Duration::seconds(MODEL_NOT_FOUND_SECS)),
        ErrorKind::Unknown => Some(Duration::seconds(UNKNOWN_SECS)),
        ErrorKind::RateLimit | ErrorKind::ServerTransient | ErrorKind::Network => {
            let exponent = failure_count.saturating_sub(1).min(16);
            let backoff = BASE_DELAY_SECS.saturating_mul(1 << exponent);
            Some(Duration::seconds(backoff.min(MAX_BACKOFF_SECS)))
        }
    }
}

/// The blacklist: (channel, model) → entry, with `*` as the channel-wide model.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: Mutex<HashMap<(String, String), BlacklistEntry>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt. Auth-fatal failures upsert the channel-wide
    /// entry; everything else upserts the (channel, model) entry with its
    /// cooldown ladder. Returns the entry written.
    pub async fn record_failure(
        &self,
        channel_id: &str,
        model_id: &str,
        kind: ErrorKind,
    ) -> BlacklistEntry {
        let now = Utc::now();
        let scoped_model = if kind.is_channel_wide() { WILDCARD_MODEL } else { model_id };
        let key = (channel_id.to_string(), scoped_model.to_string());

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key).or_insert_with(|| BlacklistEntry {
            channel_id: channel_id.to_string(),
            model_id: scoped_model.to_string(),
            failure_count: 0,
            first_failure_at: now,
            last_failure_at: now,
            blacklisted_until: Some(now),
            last_error_kind: kind,
        });

        entry.failure_count += 1;
        entry.last_failure_at = now;
        entry.last_error_kind = kind;
        entry.blacklisted_until = cooldown(kind, entry.failure_count).map(|d| now + d);
        entry.clone()
    }

    /// Block a channel until a fixed deadline (daily-cap exhaustion).
    pub async fn block_channel_until(&self, channel_id: &str, until: DateTime<Utc>) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            (channel_id.to_string(), WILDCARD_MODEL.to_string()),
            BlacklistEntry {
                channel_id: channel_id.to_string(),
                model_id: WILDCARD_MODEL.to_string(),
                failure_count: 1,
                first_failure_at: now,
                last_failure_at: now,
                blacklisted_until: Some(until),
                last_error_kind: ErrorKind::RateLimit,
            },
        );
    }

    /// Record a successful attempt: the failure counter steps down and the
    /// entry is removed once it reaches zero.
    pub async fn record_success(&self, channel_id: &str, model_id: &str) {
        let key = (channel_id.to_string(), model_id.to_string());
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.failure_count = entry.failure_count.saturating_sub(1);
            if entry.failure_count == 0 {
                entries.remove(&key);
            }
        }
    }

    /// Whether the pair is blocked right now, at either scope.
    /// Expired entries found along the way are garbage-collected.
    pub async fn is_blocked(&self, channel_id: &str, model_id: &str) -> bool {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        for scoped_model in [WILDCARD_MODEL, model_id] {
            let key = (channel_id.to_string(), scoped_model.to_string());
            match entries.get(&key) {
                Some(entry) if entry.blocks_at(now) => return true,
                Some(_) => {
                    entries.remove(&key);
                }
                None => {}
            }
        }
        false
    }

    /// Operator reset: drop every entry for the channel. Returns the count removed.
    pub async fn clear_channel(&self, channel_id: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|(ch, _), _| ch != channel_id);
        before - entries.len()
    }

    /// Periodic sweep of expired entries.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.blocks_at(now));
    }

    /// Currently active entries, for the admin endpoint.
    pub async fn active_entries(&self) -> Vec<BlacklistEntry> {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        let mut active: Vec<BlacklistEntry> = entries
            .values()
            .filter(|e| e.blocks_at(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            (&a.channel_id, &a.model_id).cmp(&(&b.channel_id, &b.model_id))
        });
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_ladder_doubles_and_caps() {
        let secs = |n| cooldown(ErrorKind::RateLimit, n).map(|d| d.num_seconds());
        assert_eq!(secs(1), Some(30));
        assert_eq!(secs(2), Some(60));
        assert_eq!(secs(3), Some(120));
        assert_eq!(secs(4), Some(240));
        assert_eq!(secs(5), Some(300)); // capped
        assert_eq!(secs(10), Some(300));
    }

    #[test]
    fn cooldown_special_cases() {
        assert_eq!(cooldown(ErrorKind::AuthFatal, 1), None);
        assert_eq!(
            cooldown(ErrorKind::ModelNotFound, 1).map(|d| d.num_seconds()),
            Some(3_600)
        );
        assert_eq!(cooldown(ErrorKind::Unknown, 1).map(|d| d.num_seconds()), Some(60));
    }

    #[tokio::test]
    async fn model_scoped_failure_blocks_only_that_model() {
        let bl = Blacklist::new();
        bl.record_failure("ch", "model-a", ErrorKind::RateLimit).await;

        assert!(bl.is_blocked("ch", "model-a").await);
        assert!(!bl.is_blocked("ch", "model-b").await);
        assert!(!bl.is_blocked("other", "model-a").await);
    }

    #[tokio::test]
    async fn auth_fatal_blocks_the_whole_channel_indefinitely() {
        let bl = Blacklist::new();
        let entry = bl.record_failure("ch", "model-a", ErrorKind::AuthFatal).await;
        assert_eq!(entry.model_id, WILDCARD_MODEL);
        assert_eq!(entry.blacklisted_until, None);

        assert!(bl.is_blocked("ch", "model-a").await);
        assert!(bl.is_blocked("ch", "anything-else").await);

        // A sweep must not remove an indefinite entry.
        bl.sweep().await;
        assert!(bl.is_blocked("ch", "model-a").await);
    }

    #[tokio::test]
    async fn repeated_failures_grow_the_cooldown() {
        let bl = Blacklist::new();
        let first = bl.record_failure("ch", "m", ErrorKind::ServerTransient).await;
        let second = bl.record_failure("ch", "m", ErrorKind::ServerTransient).await;
        assert_eq!(first.failure_count, 1);
        assert_eq!(second.failure_count, 2);
        assert!(second.blacklisted_until > first.blacklisted_until);
    }

    #[tokio::test]
    async fn success_decrements_and_removes_at_zero() {
        let bl = Blacklist::new();
        bl.record_failure("ch", "m", ErrorKind::RateLimit).await;
        bl.record_failure("ch", "m", ErrorKind::RateLimit).await;

        bl.record_success("ch", "m").await;
        // count 2 → 1, entry remains
        assert_eq!(bl.active_entries().await.len(), 1);

        bl.record_success("ch", "m").await;
        assert!(bl.active_entries().await.is_empty());
        assert!(!bl.is_blocked("ch", "m").await);
    }

    #[tokio::test]
    async fn clear_channel_removes_all_scopes() {
        let bl = Blacklist::new();
        bl.record_failure("ch", "m1", ErrorKind::RateLimit).await;
        bl.record_failure("ch", "m2", ErrorKind::ServerTransient).await;
        bl.record_failure("ch", "x", ErrorKind::AuthFatal).await;
        bl.record_failure("other", "m1", ErrorKind::RateLimit).await;

        let removed = bl.clear_channel("ch").await;
        assert_eq!(removed, 3);
        assert!(!bl.is_blocked("ch", "m1").await);
        assert!(bl.is_blocked("other", "m1").await);
    }

    #[tokio::test]
    async fn daily_cap_block_expires_at_deadline() {
        let bl = Blacklist::new();
        bl.block_channel_until("ch", Utc::now() + Duration::hours(1)).await;
        assert!(bl.is_blocked("ch", "any-model").await);

        bl.block_channel_until("ch", Utc::now() - Duration::seconds(1)).await;
        assert!(!bl.is_blocked("ch", "any-model").await);
    }

    #[tokio::test]
    async fn expired_entries_are_gone_after_lookup() {
        let bl = Blacklist::new();
        bl.block_channel_until("ch", Utc::now() - Duration::seconds(1)).await;
        assert!(!bl.is_blocked("ch", "m").await);
        // The expired entry was GC'd by the lookup itself.
        assert!(bl.active_entries().await.is_empty());
    }
}
