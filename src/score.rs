//! Multi-factor channel scoring.
//!
//! Every candidate (channel, model) pair gets a seven-digit hierarchical
//! score. Each digit is a tier in 0..=9 and the digits are ordered by
//! significance: cost dominates everything, then locality, context window,
//! parameter count, speed, quality, reliability. Comparing the encoded
//! integers therefore compares candidates lexicographically across all seven
//! factors at once.
//!
//! The cost digit is special: tier 9 is reserved for *validated free*
//! candidates. A paid candidate caps at 8, which is what makes the
//! free-beats-paid guarantee hold under every strategy.

use serde::{Deserialize, Serialize};

/// Latency at or below which a channel earns the top speed tier.
const SPEED_BEST_MS: f64 = 500.0;
/// Latency at or above which a channel earns the bottom speed tier.
const SPEED_WORST_MS: f64 = 30_000.0;

/// The seven-tier routing score. Higher is better in every digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingScore {
    pub cost: u8,
    pub local: u8,
    pub context: u8,
    pub param: u8,
    pub speed: u8,
    pub quality: u8,
    pub reliability: u8,
}

impl RoutingScore {
    /// Encode as the canonical seven-digit integer.
    pub fn encode(&self) -> u32 {
        u32::from(self.cost) * 1_000_000
            + u32::from(self.local) * 100_000
            + u32::from(self.context) * 10_000
            + u32::from(self.param) * 1_000
            + u32::from(self.speed) * 100
            + u32::from(self.quality) * 10
            + u32::from(self.reliability)
    }

    /// A candidate is free only when its cost digit is the reserved tier 9.
    pub fn is_free(&self) -> bool {
        self.cost == 9
    }

    fn digits(&self) -> [u8; 7] {
        [self.cost, self.local, self.context, self.param, self.speed, self.quality, self.reliability]
    }
}

impl std::fmt::Display for RoutingScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:07}", self.encode())
    }
}

/// Cost digit. Tier 9 requires both a non-positive estimated cost and the
/// free validation (channel tagged `free` with explicit zero pricing, or a
/// `:free` model id). Paid candidates map monotonically into 0..=8.
pub fn cost_tier(cost_usd: f64, free_validated: bool) -> u8 {
    if cost_usd <= 0.0 && free_validated {
        return 9;
    }
    let cost = cost_usd.max(0.0);
    let tier = (8.0 / (1.0 + (1.0 + cost * 100.0).ln())).floor();
    (tier as u8).min(8)
}

/// Locality digit: 9 for local channels, otherwise latency-proportional 0..=8.
pub fn local_tier(is_local: bool, ema_latency_ms: Option<f64>) -> u8 {
    if is_local {
        9
    } else {
        // Same latency curve as the speed digit, compressed into 0..=8.
        (u32::from(speed_tier(ema_latency_ms)) * 8 / 9) as u8
    }
}

/// Context-window digit from the advertised context length in tokens.
pub fn context_tier(context_length: Option<u64>) -> u8 {
    match context_length {
        Some(n) if n >= 128_000 => 9,
        Some(n) if n >= 32_000 => 8,
        Some(n) if n >= 16_000 => 7,
        Some(n) if n >= 8_000 => 6,
        Some(n) if n >= 4_000 => 5,
        Some(_) => 3,
        None => 4,
    }
}

/// Parameter-count digit from the advertised parameter count.
pub fn param_tier(parameter_count: Option<u64>) -> u8 {
    const B: u64 = 1_000_000_000;
    match parameter_count {
        Some(n) if n >= 70 * B => 9,
        Some(n) if n >= 30 * B => 8,
        Some(n) if n >= 13 * B => 7,
        Some(n) if n >= 7 * B => 6,
        Some(n) if n >= 3 * B => 5,
        Some(n) if n >= B => 4,
        Some(_) => 3,
        None => 4,
    }
}

/// Speed digit from the exponential moving average of end-to-end latency.
/// 9 at or under 500 ms, 0 at or over 30 s, linear in between. Channels with
/// no observations yet sit in the middle.
pub fn speed_tier(ema_latency_ms: Option<f64>) -> u8 {
    let Some(ms) = ema_latency_ms else { return 5 };
    if ms <= SPEED_BEST_MS {
        return 9;
    }
    if ms >= SPEED_WORST_MS {
        return 0;
    }
    let fraction = (SPEED_WORST_MS - ms) / (SPEED_WORST_MS - SPEED_BEST_MS);
    (fraction * 9.0).round() as u8
}

/// Quality digit: the midpoint of the parameter and context digits.
pub fn quality_tier(param: u8, context: u8) -> u8 {
    (((f64::from(param) + f64::from(context)) / 2.0).round() as u8).min(9)
}

/// Reliability digit: `floor(9 × success_rate)` over the rolling window.
/// Channels with no history start at 7.
pub fn reliability_tier(success_rate: Option<f64>) -> u8 {
    match success_rate {
        Some(rate) => (9.0 * rate.clamp(0.0, 1.0)).floor() as u8,
        None => 7,
    }
}

/// Routing strategy — a fixed re-weighting of the seven digits.
///
/// Whatever the strategy, validated-free candidates sort above all paid ones:
/// the sort key keeps a free bit above the permuted digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    CostFirst,
    #[default]
    FreeFirst,
    LocalFirst,
    Balanced,
    SpeedOptimized,
    QualityOptimized,
}

impl Strategy {
    /// Digit permutation, most significant first. Indices into
    /// `[cost, local, context, param, speed, quality, reliability]`.
    fn permutation(&self) -> [usize; 7] {
        match self {
            // Canonical significance order.
            Self::CostFirst | Self::FreeFirst | Self::Balanced => [0, 1, 2, 3, 4, 5, 6],
            Self::LocalFirst => [1, 0, 2, 3, 4, 5, 6],
            Self::SpeedOptimized => [4, 0, 1, 2, 3, 5, 6],
            Self::QualityOptimized => [5, 0, 1, 2, 3, 4, 6],
        }
    }

    /// Sort key for descending-order candidate ranking.
    pub fn sort_key(&self, score: &RoutingScore) -> u64 {
        let digits = score.digits();
        let mut key: u64 = u64::from(score.is_free());
        for idx in self.permutation() {
            key = key * 10 + u64::from(digits[idx]);
        }
        key
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "cost_first" => Some(Self::CostFirst),
            "free_first" => Some(Self::FreeFirst),
            "local_first" => Some(Self::LocalFirst),
            "balanced" => Some(Self::Balanced),
            "speed_optimized" => Some(Self::SpeedOptimized),
            "quality_optimized" => Some(Self::QualityOptimized),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CostFirst => "cost_first",
            Self::FreeFirst => "free_first",
            Self::LocalFirst => "local_first",
            Self::Balanced => "balanced",
            Self::SpeedOptimized => "speed_optimized",
            Self::QualityOptimized => "quality_optimized",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score_with(cost: u8, local: u8) -> RoutingScore {
        RoutingScore { cost, local, context: 5, param: 5, speed: 5, quality: 5, reliability: 7 }
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    #[test]
    fn encode_packs_digits_by_significance() {
        let s = RoutingScore {
            cost: 9,
            local: 8,
            context: 7,
            param: 6,
            speed: 5,
            quality: 4,
            reliability: 3,
        };
        assert_eq!(s.encode(), 9_876_543);
    }

    #[test]
    fn display_is_zero_padded() {
        let s = RoutingScore {
            cost: 0,
            local: 1,
            context: 2,
            param: 3,
            speed: 4,
            quality: 5,
            reliability: 6,
        };
        assert_eq!(s.to_string(), "0123456");
    }

    // -----------------------------------------------------------------------
    // Cost tier
    // -----------------------------------------------------------------------

    #[test]
    fn zero_cost_without_validation_is_not_free() {
        // Tier 9 is reserved: unvalidated zero cost caps at 8.
        assert_eq!(cost_tier(0.0, false), 8);
        assert_eq!(cost_tier(0.0, true), 9);
    }

    #[test]
    fn positive_cost_never_reaches_tier_nine() {
        for cost in [0.0001, 0.01, 0.5, 2.0, 100.0] {
            assert!(cost_tier(cost, true) <= 8, "cost {cost} broke the paid cap");
        }
    }

    #[test]
    fn cost_tier_is_monotonically_non_increasing() {
        let costs = [0.0001, 0.001, 0.01, 0.1, 1.0, 10.0, 100.0];
        let tiers: Vec<u8> = costs.iter().map(|c| cost_tier(*c, false)).collect();
        for pair in tiers.windows(2) {
            assert!(pair[0] >= pair[1], "tiers not monotone: {tiers:?}");
        }
    }

    // -----------------------------------------------------------------------
    // Locality / context / param / speed / quality / reliability
    // -----------------------------------------------------------------------

    #[test]
    fn local_channel_gets_top_locality() {
        assert_eq!(local_tier(true, None), 9);
        assert_eq!(local_tier(true, Some(25_000.0)), 9);
    }

    #[test]
    fn remote_locality_never_reaches_nine() {
        assert!(local_tier(false, Some(100.0)) <= 8);
        assert!(local_tier(false, None) <= 8);
    }

    #[test]
    fn context_tier_boundaries() {
        assert_eq!(context_tier(Some(200_000)), 9);
        assert_eq!(context_tier(Some(128_000)), 9);
        assert_eq!(context_tier(Some(32_768)), 8);
        assert_eq!(context_tier(Some(16_384)), 7);
        assert_eq!(context_tier(Some(8_192)), 6);
        assert_eq!(context_tier(Some(4_096)), 5);
        assert_eq!(context_tier(Some(2_048)), 3);
        assert_eq!(context_tier(None), 4);
    }

    #[test]
    fn param_tier_boundaries() {
        const B: u64 = 1_000_000_000;
        assert_eq!(param_tier(Some(70 * B)), 9);
        assert_eq!(param_tier(Some(34 * B)), 8);
        assert_eq!(param_tier(Some(13 * B)), 7);
        assert_eq!(param_tier(Some(8 * B)), 6);
        assert_eq!(param_tier(Some(3 * B)), 5);
        assert_eq!(param_tier(Some(B)), 4);
        assert_eq!(param_tier(Some(500_000_000)), 3);
        assert_eq!(param_tier(None), 4);
    }

    #[test]
    fn speed_tier_endpoints_and_midrange() {
        assert_eq!(speed_tier(Some(200.0)), 9);
        assert_eq!(speed_tier(Some(500.0)), 9);
        assert_eq!(speed_tier(Some(30_000.0)), 0);
        assert_eq!(speed_tier(Some(60_000.0)), 0);
        let mid = speed_tier(Some(15_000.0));
        assert!((1..=8).contains(&mid), "midrange latency got tier {mid}");
        assert_eq!(speed_tier(None), 5);
    }

    #[test]
    fn quality_is_midpoint_of_param_and_context() {
        assert_eq!(quality_tier(9, 9), 9);
        assert_eq!(quality_tier(6, 7), 7); // 6.5 rounds up
        assert_eq!(quality_tier(0, 0), 0);
    }

    #[test]
    fn reliability_from_success_rate() {
        assert_eq!(reliability_tier(Some(1.0)), 9);
        assert_eq!(reliability_tier(Some(0.5)), 4);
        assert_eq!(reliability_tier(Some(0.0)), 0);
        assert_eq!(reliability_tier(None), 7);
    }

    // -----------------------------------------------------------------------
    // Strategy overlay
    // -----------------------------------------------------------------------

    #[test]
    fn free_beats_paid_under_every_strategy() {
        // A mediocre free candidate against a paid candidate that wins every
        // other digit. The free bit must dominate for all six strategies.
        let free = RoutingScore {
            cost: 9,
            local: 0,
            context: 3,
            param: 3,
            speed: 1,
            quality: 3,
            reliability: 5,
        };
        let paid = RoutingScore {
            cost: 8,
            local: 9,
            context: 9,
            param: 9,
            speed: 9,
            quality: 9,
            reliability: 9,
        };
        for strategy in [
            Strategy::CostFirst,
            Strategy::FreeFirst,
            Strategy::LocalFirst,
            Strategy::Balanced,
            Strategy::SpeedOptimized,
            Strategy::QualityOptimized,
        ] {
            assert!(
                strategy.sort_key(&free) > strategy.sort_key(&paid),
                "paid outranked free under {strategy}"
            );
        }
    }

    #[test]
    fn local_first_breaks_free_ties_on_locality() {
        let local_free = score_with(9, 9);
        let remote_free = score_with(9, 2);
        assert!(Strategy::LocalFirst.sort_key(&local_free) > Strategy::LocalFirst.sort_key(&remote_free));
        // Default strategy also prefers local here because local is digit two.
        assert!(Strategy::FreeFirst.sort_key(&local_free) > Strategy::FreeFirst.sort_key(&remote_free));
    }

    #[test]
    fn speed_optimized_promotes_speed_within_paid_candidates() {
        let fast = RoutingScore {
            cost: 4,
            local: 0,
            context: 5,
            param: 5,
            speed: 9,
            quality: 5,
            reliability: 7,
        };
        let cheap_slow = RoutingScore {
            cost: 7,
            local: 0,
            context: 5,
            param: 5,
            speed: 1,
            quality: 5,
            reliability: 7,
        };
        assert!(Strategy::SpeedOptimized.sort_key(&fast) > Strategy::SpeedOptimized.sort_key(&cheap_slow));
        // The default order decides the other way round.
        assert!(Strategy::FreeFirst.sort_key(&cheap_slow) > Strategy::FreeFirst.sort_key(&fast));
    }

    #[test]
    fn strategy_parse_round_trips_display() {
        for strategy in [
            Strategy::CostFirst,
            Strategy::FreeFirst,
            Strategy::LocalFirst,
            Strategy::Balanced,
            Strategy::SpeedOptimized,
            Strategy::QualityOptimized,
        ] {
            assert_eq!(Strategy::parse(&strategy.to_string()), Some(strategy));
        }
        assert_eq!(Strategy::parse("best_of_n"), None);
    }
}
