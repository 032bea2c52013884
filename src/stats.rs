//! Rolling per-channel health statistics and daily request counters.
//!
//! The failover executor records an observation per attempt; the scorer reads
//! the latency EMA and rolling success rate when computing speed and
//! reliability digits. One `DashMap` entry per channel keeps the request path
//! contention-free.

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// Rolling window length for the success-rate calculation.
const WINDOW: usize = 50;
/// EMA smoothing factor for latency.
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct ChannelHealth {
    ema_latency_ms: Option<f64>,
    outcomes: VecDeque<bool>,
}

/// Per-channel health table shared between the failover executor (writer)
/// and the scorer (reader).
#[derive(Debug, Default)]
pub struct RollingStats {
    channels: DashMap<String, ChannelHealth>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed attempt against a channel.
    pub fn record(&self, channel_id: &str, latency_ms: u64, success: bool) {
        let mut health = self.channels.entry(channel_id.to_string()).or_default();

        let sample = latency_ms as f64;
        health.ema_latency_ms = Some(match health.ema_latency_ms {
            Some(prev) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev,
            None => sample,
        });

        if health.outcomes.len() == WINDOW {
            health.outcomes.pop_front();
        }
        health.outcomes.push_back(success);
    }

    /// Smoothed end-to-end latency, `None` until the first observation.
    pub fn ema_latency_ms(&self, channel_id: &str) -> Option<f64> {
        self.channels.get(channel_id).and_then(|h| h.ema_latency_ms)
    }

    /// Rolling success rate over the last [`WINDOW`] attempts, `None` until
    /// the first observation.
    pub fn success_rate(&self, channel_id: &str) -> Option<f64> {
        self.channels.get(channel_id).and_then(|h| {
            if h.outcomes.is_empty() {
                None
            } else {
                let ok = h.outcomes.iter().filter(|s| **s).count();
                Some(ok as f64 / h.outcomes.len() as f64)
            }
        })
    }

    /// Per-channel rows for the admin stats endpoint.
    pub fn snapshot(&self) -> Vec<serde_json::Value> {
        let mut rows: Vec<serde_json::Value> = self
            .channels
            .iter()
            .map(|entry| {
                let h = entry.value();
                let ok = h.outcomes.iter().filter(|s| **s).count();
                serde_json::json!({
                    "channel_id": entry.key(),
                    "ema_latency_ms": h.ema_latency_ms,
                    "window_attempts": h.outcomes.len(),
                    "window_successes": ok,
                })
            })
            .collect();
        rows.sort_by_key(|r| r["channel_id"].as_str().map(String::from));
        rows
    }
}

/// Per-channel daily request counters, reset at UTC midnight.
#[derive(Debug, Default)]
pub struct DailyCounters {
    counts: DashMap<String, (NaiveDate, u64)>,
}

impl DailyCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against the channel and return today's running total.
    pub fn increment(&self, channel_id: &str) -> u64 {
        let today = Utc::now().date_naive();
        let mut entry = self
            .counts
            .entry(channel_id.to_string())
            .or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        entry.1 += 1;
        entry.1
    }

    /// Today's count without incrementing.
    pub fn today(&self, channel_id: &str) -> u64 {
        let today = Utc::now().date_naive();
        self.counts
            .get(channel_id)
            .filter(|e| e.0 == today)
            .map_or(0, |e| e.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_seeds_the_ema() {
        let stats = RollingStats::new();
        stats.record("ch", 1000, true);
        assert_eq!(stats.ema_latency_ms("ch"), Some(1000.0));
    }

    #[test]
    fn ema_moves_toward_new_samples() {
        let stats = RollingStats::new();
        stats.record("ch", 1000, true);
        stats.record("ch", 2000, true);
        let ema = stats.ema_latency_ms("ch").expect("ema present");
        assert!(ema > 1000.0 && ema < 2000.0, "got {ema}");
    }

    #[test]
    fn success_rate_reflects_window_contents() {
        let stats = RollingStats::new();
        for _ in 0..3 {
            stats.record("ch", 100, true);
        }
        stats.record("ch", 100, false);
        assert_eq!(stats.success_rate("ch"), Some(0.75));
    }

    #[test]
    fn window_is_bounded_at_fifty() {
        let stats = RollingStats::new();
        // 50 failures, then 50 successes: the failures must age out entirely.
        for _ in 0..WINDOW {
            stats.record("ch", 100, false);
        }
        for _ in 0..WINDOW {
            stats.record("ch", 100, true);
        }
        assert_eq!(stats.success_rate("ch"), Some(1.0));
    }

    #[test]
    fn unknown_channel_has_no_stats() {
        let stats = RollingStats::new();
        assert_eq!(stats.ema_latency_ms("nope"), None);
        assert_eq!(stats.success_rate("nope"), None);
    }

    #[test]
    fn daily_counter_increments_per_channel() {
        let counters = DailyCounters::new();
        assert_eq!(counters.increment("a"), 1);
        assert_eq!(counters.increment("a"), 2);
        assert_eq!(counters.increment("b"), 1);
        assert_eq!(counters.today("a"), 2);
        assert_eq!(counters.today("missing"), 0);
    }
}
