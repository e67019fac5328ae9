//! Market-making (dealer hedging) detection.
//!
//! Dealers hedging a book tend to print balanced call and put volume at the same
//! strike within seconds of each other (straddle coordination), and to sell
//! volatility into both legs (volatility crush). Flow that looks like this is
//! discounted so only directional institutional activity scores highly.
//!
//! Volatility-crush detection needs per-contract price-decline tracking that the
//! sample feed does not carry yet, so it contributes the configured constant and
//! the decline metrics are reported as zero.

use crate::{
    config::MarketMakingConfig,
    types::{OptionKind, PressureSample},
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterRecommendation {
    Accept,
    Monitor,
    Reject,
}

impl FilterRecommendation {
    /// REJECT above `max`, MONITOR from 70% of `max`, otherwise ACCEPT.
    pub fn classify(score: f64, max: f64) -> Self {
        if score > max {
            FilterRecommendation::Reject
        } else if score >= 0.7 * max {
            FilterRecommendation::Monitor
        } else {
            FilterRecommendation::Accept
        }
    }
}

/// One print of activity at a strike
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct StrikeActivity {
    pub kind: OptionKind,
    pub time: DateTime<Utc>,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarketMakingAnalysis {
    pub straddle_call_volume: f64,
    pub straddle_put_volume: f64,
    /// Seconds between the closest call and put prints, if both legs traded
    pub straddle_time_coordination_secs: Option<f64>,
    pub straddle_probability: f64,
    pub call_price_decline: f64,
    pub put_price_decline: f64,
    pub both_sides_declining: bool,
    pub volatility_crush_probability: f64,
    pub market_making_score: f64,
    pub institutional_likelihood: f64,
    pub filter: FilterRecommendation,
}

/// Tracks very recent per-strike activity across both option kinds.
#[derive(Debug, Clone)]
pub struct MarketMakingDetector {
    config: MarketMakingConfig,
    activity: FnvHashMap<Decimal, VecDeque<StrikeActivity>>,
    swept_at: Option<DateTime<Utc>>,
}

impl MarketMakingDetector {
    pub fn new(config: MarketMakingConfig) -> Self {
        Self {
            config,
            activity: FnvHashMap::default(),
            swept_at: None,
        }
    }

    pub fn detect(&mut self, sample: &PressureSample) -> MarketMakingAnalysis {
        let recent = self.record(sample);
        analyze_activity(&self.config, sample, &recent)
    }

    /// Add the sample to its strike's activity, prune anything older than the
    /// activity horizon (relative to the sample) and return a snapshot.
    pub fn record(&mut self, sample: &PressureSample) -> Vec<StrikeActivity> {
        self.sweep_stale(sample.window_start);

        let cutoff = sample.window_start - TimeDelta::seconds(self.config.activity_horizon_secs);
        let activity = self.activity.entry(sample.strike).or_default();

        while activity.front().is_some_and(|a| a.time < cutoff) {
            activity.pop_front();
        }
        activity.push_back(StrikeActivity {
            kind: sample.option_kind,
            time: sample.window_start,
            volume: sample.total_volume(),
        });

        activity.iter().copied().collect()
    }

    /// Number of strikes with retained activity.
    pub fn tracked_strikes(&self) -> usize {
        self.activity.len()
    }

    /// Drop strikes whose newest print is past the horizon, at most once per
    /// horizon of sample time.
    fn sweep_stale(&mut self, now: DateTime<Utc>) {
        let horizon = TimeDelta::seconds(self.config.activity_horizon_secs);
        if self.swept_at.is_some_and(|at| now - at < horizon) {
            return;
        }

        let cutoff = now - horizon;
        self.activity
            .retain(|_, activity| activity.back().is_some_and(|a| a.time >= cutoff));
        self.swept_at = Some(now);
    }

    #[cfg(test)]
    fn activity_len(&self, strike: &Decimal) -> usize {
        self.activity.get(strike).map_or(0, VecDeque::len)
    }
}

/// Score `sample` against a snapshot of recent activity at its strike.
pub fn analyze_activity(
    config: &MarketMakingConfig,
    sample: &PressureSample,
    recent: &[StrikeActivity],
) -> MarketMakingAnalysis {
    let window_secs = config.straddle_time_window_secs.max(1) as f64;
    let gap_secs = |time: DateTime<Utc>| (time - sample.window_start).num_milliseconds().abs() as f64 / 1_000.0;

    let mut call_volume = 0.0;
    let mut put_volume = 0.0;
    let mut closest_call: Option<(f64, DateTime<Utc>)> = None;
    let mut closest_put: Option<(f64, DateTime<Utc>)> = None;

    for activity in recent.iter().filter(|a| gap_secs(a.time) <= window_secs) {
        let gap = gap_secs(activity.time);
        let (volume, closest) = match activity.kind {
            OptionKind::Call => (&mut call_volume, &mut closest_call),
            OptionKind::Put => (&mut put_volume, &mut closest_put),
        };
        *volume += activity.volume;
        if closest.is_none_or(|(best, _)| gap < best) {
            *closest = Some((gap, activity.time));
        }
    }

    let volume_balance = if call_volume > 0.0 && put_volume > 0.0 {
        2.0 * call_volume.min(put_volume) / (call_volume + put_volume)
    } else {
        0.0
    };

    let coordination_secs = match (closest_call, closest_put) {
        (Some((_, call_time)), Some((_, put_time))) => {
            Some((call_time - put_time).num_milliseconds().abs() as f64 / 1_000.0)
        }
        _ => None,
    };
    let time_score = coordination_secs
        .map(|secs| 1.0 - (secs / window_secs).min(1.0))
        .unwrap_or(0.0);

    let straddle_probability = 0.7 * volume_balance + 0.3 * time_score;
    let crush_probability = config.volatility_crush_probability;
    let market_making_score = (0.7 * straddle_probability + 0.3 * crush_probability).clamp(0.0, 1.0);

    MarketMakingAnalysis {
        straddle_call_volume: call_volume,
        straddle_put_volume: put_volume,
        straddle_time_coordination_secs: coordination_secs,
        straddle_probability,
        call_price_decline: 0.0,
        put_price_decline: 0.0,
        both_sides_declining: false,
        volatility_crush_probability: crush_probability,
        market_making_score,
        institutional_likelihood: 1.0 - market_making_score,
        filter: FilterRecommendation::classify(market_making_score, config.max_mm_probability),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_utils::{sample, time};
    use rust_decimal_macros::dec;

    #[test]
    fn test_filter_classify() {
        struct TestCase {
            score: f64,
            expected: FilterRecommendation,
        }

        let tests = vec![
            TestCase {
                // TC0: well below the ceiling
                score: 0.1,
                expected: FilterRecommendation::Accept,
            },
            TestCase {
                // TC1: exactly 70% of the ceiling
                score: 0.21,
                expected: FilterRecommendation::Monitor,
            },
            TestCase {
                // TC2: at the ceiling is still not rejected
                score: 0.3,
                expected: FilterRecommendation::Monitor,
            },
            TestCase {
                // TC3: above the ceiling
                score: 0.31,
                expected: FilterRecommendation::Reject,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = FilterRecommendation::classify(test.score, 0.3);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_single_sided_flow_is_institutional() {
        let mut detector = MarketMakingDetector::new(MarketMakingConfig::default());

        let analysis = detector.detect(&sample(dec!(450), OptionKind::Call, time(14, 30, 0)));

        assert_eq!(analysis.straddle_put_volume, 0.0);
        assert_eq!(analysis.straddle_probability, 0.0);
        assert_eq!(analysis.straddle_time_coordination_secs, None);
        assert!((analysis.market_making_score - 0.03).abs() < 1e-9);
        assert!((analysis.institutional_likelihood - 0.97).abs() < 1e-9);
        assert_eq!(analysis.filter, FilterRecommendation::Accept);
        assert!(!analysis.both_sides_declining);
    }

    #[test]
    fn test_coordinated_straddle_is_rejected() {
        let mut detector = MarketMakingDetector::new(MarketMakingConfig::default());

        detector.detect(&sample(dec!(450), OptionKind::Call, time(14, 30, 0)));
        let analysis = detector.detect(&sample(dec!(450), OptionKind::Put, time(14, 30, 0)));

        // Balanced volume, zero time gap
        assert_eq!(analysis.straddle_call_volume, 1_000.0);
        assert_eq!(analysis.straddle_put_volume, 1_000.0);
        assert_eq!(analysis.straddle_time_coordination_secs, Some(0.0));
        assert!((analysis.straddle_probability - 1.0).abs() < 1e-9);
        assert!((analysis.market_making_score - 0.73).abs() < 1e-9);
        assert_eq!(analysis.filter, FilterRecommendation::Reject);
    }

    #[test]
    fn test_straddle_time_coordination_decays_with_gap() {
        let config = MarketMakingConfig::default();
        let mut detector = MarketMakingDetector::new(config.clone());

        let mut call = sample(dec!(450), OptionKind::Call, time(14, 30, 0));
        call.bid_volume = 100.0;
        call.ask_volume = 200.0;
        detector.detect(&call);
        let analysis = detector.detect(&sample(dec!(450), OptionKind::Put, time(14, 32, 30)));

        // 150s of a 300s window, volumes 300 vs 1000
        assert_eq!(analysis.straddle_time_coordination_secs, Some(150.0));
        let balance = 2.0 * 300.0 / 1_300.0;
        let expected = 0.7 * balance + 0.3 * 0.5;
        assert!((analysis.straddle_probability - expected).abs() < 1e-9);
    }

    #[test]
    fn test_other_strikes_and_stale_activity_ignored() {
        let mut detector = MarketMakingDetector::new(MarketMakingConfig::default());

        detector.detect(&sample(dec!(455), OptionKind::Put, time(14, 30, 0)));
        detector.detect(&sample(dec!(450), OptionKind::Put, time(14, 20, 0)));
        let analysis = detector.detect(&sample(dec!(450), OptionKind::Call, time(14, 30, 0)));

        assert_eq!(analysis.straddle_put_volume, 0.0);
        assert_eq!(analysis.filter, FilterRecommendation::Accept);
        // Stale put at 14:20 pruned beyond the 300s horizon
        assert_eq!(detector.activity_len(&dec!(450)), 1);
    }

    #[test]
    fn test_strikes_that_stop_trading_are_swept() {
        let mut detector = MarketMakingDetector::new(MarketMakingConfig::default());

        for strike in [dec!(440), dec!(445), dec!(450)] {
            detector.detect(&sample(strike, OptionKind::Call, time(14, 0, 0)));
        }
        assert_eq!(detector.tracked_strikes(), 3);

        detector.detect(&sample(dec!(450), OptionKind::Call, time(14, 10, 0)));

        assert_eq!(detector.tracked_strikes(), 1);
        assert_eq!(detector.activity_len(&dec!(440)), 0);
        assert_eq!(detector.activity_len(&dec!(450)), 1);
    }
}
