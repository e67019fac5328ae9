//! Real-time pressure significance from a short per-contract history.
//!
//! Sub-scores are all within `[0, 1]`:
//! - significance: ratio, volume and sample confidence blended
//! - trend: least-squares slope of the ratio over the retained history
//! - volume concentration: how one-sided the volume is towards the dominant side
//! - time persistence: share of history at or above the minimum ratio

use crate::{
    config::PressureConfig,
    types::{ContractKey, DominantSide, PressureSample},
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Placeholder until cross-strike cluster detection exists.
pub const CLUSTER_COORDINATION_PLACEHOLDER: f64 = 0.5;

const NEUTRAL_TREND: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PressureAnalysis {
    pub pressure_significance: f64,
    pub trend_strength: f64,
    pub cluster_coordination: f64,
    pub volume_concentration: f64,
    pub time_persistence: f64,
}

#[derive(Debug, Clone)]
struct ContractHistory {
    ratios: VecDeque<f64>,
    last_seen: DateTime<Utc>,
}

/// Keeps the last `history_len` pressure ratios per (strike, kind).
///
/// A contract idle for longer than the configured horizon starts a fresh history,
/// and idle contracts are swept so the map only holds actively trading series.
#[derive(Debug, Clone)]
pub struct PressureAnalyzer {
    config: PressureConfig,
    history: FnvHashMap<ContractKey, ContractHistory>,
    swept_at: Option<DateTime<Utc>>,
}

impl PressureAnalyzer {
    pub fn new(config: PressureConfig) -> Self {
        Self {
            config,
            history: FnvHashMap::default(),
            swept_at: None,
        }
    }

    /// Record the sample and score it against the updated history.
    pub fn analyze(&mut self, sample: &PressureSample) -> PressureAnalysis {
        let history = self.record(sample);
        analyze_history(&self.config, sample, &history)
    }

    /// Append the sample's ratio and return a snapshot of the retained history
    /// (oldest first, including the new ratio).
    pub fn record(&mut self, sample: &PressureSample) -> Vec<f64> {
        let now = sample.window_start;
        self.sweep_idle(now);

        let max = self.config.history_len;
        let cutoff = now - self.idle_horizon();
        let entry = self.history.entry(sample.key()).or_insert_with(|| ContractHistory {
            ratios: VecDeque::with_capacity(max),
            last_seen: now,
        });

        if entry.last_seen < cutoff {
            entry.ratios.clear();
        }
        if entry.ratios.len() >= max {
            entry.ratios.pop_front();
        }
        entry.ratios.push_back(sample.pressure_ratio);
        entry.last_seen = entry.last_seen.max(now);

        entry.ratios.iter().copied().collect()
    }

    /// Number of (strike, kind) series currently held.
    pub fn tracked_contracts(&self) -> usize {
        self.history.len()
    }

    fn idle_horizon(&self) -> TimeDelta {
        TimeDelta::seconds(self.config.idle_horizon_secs)
    }

    /// Drop idle series, at most once per idle horizon of sample time.
    fn sweep_idle(&mut self, now: DateTime<Utc>) {
        let horizon = self.idle_horizon();
        if self.swept_at.is_some_and(|at| now - at < horizon) {
            return;
        }

        let cutoff = now - horizon;
        self.history.retain(|_, entry| entry.last_seen >= cutoff);
        self.swept_at = Some(now);
    }

    #[cfg(test)]
    fn history_len(&self, key: &ContractKey) -> usize {
        self.history.get(key).map_or(0, |entry| entry.ratios.len())
    }
}

/// Score a sample against an explicit history snapshot. Pure, so the batch
/// engine can run it on worker threads.
pub fn analyze_history(
    config: &PressureConfig,
    sample: &PressureSample,
    history: &[f64],
) -> PressureAnalysis {
    PressureAnalysis {
        pressure_significance: pressure_significance(sample),
        trend_strength: trend_strength(history),
        cluster_coordination: CLUSTER_COORDINATION_PLACEHOLDER,
        volume_concentration: volume_concentration(sample),
        time_persistence: time_persistence(history, config.min_pressure_ratio),
    }
}

pub fn pressure_significance(sample: &PressureSample) -> f64 {
    let ratio_score = (sample.pressure_ratio / 10.0).min(1.0);
    let volume_score = (sample.total_volume() / 1_000.0).min(1.0);
    let confidence_score = sample.confidence;

    (0.5 * ratio_score + 0.3 * volume_score + 0.2 * confidence_score).clamp(0.0, 1.0)
}

/// Relative magnitude of change in the ratio, `[0, 1]`.
///
/// >= 3 points: |least-squares slope| / mean ratio. 2 points: |difference| / first.
/// Fewer: neutral 0.5.
pub fn trend_strength(history: &[f64]) -> f64 {
    match history {
        [] | [_] => NEUTRAL_TREND,
        [first, second] => {
            if *first > 0.0 {
                ((second - first).abs() / first).min(1.0)
            } else if second != first {
                1.0
            } else {
                0.0
            }
        }
        _ => {
            let n = history.len() as f64;
            let mean_x = (n - 1.0) / 2.0;
            let mean_y = history.iter().sum::<f64>() / n;

            let (num, denom) = history.iter().enumerate().fold((0.0, 0.0), |(num, denom), (i, y)| {
                let dx = i as f64 - mean_x;
                (num + dx * (y - mean_y), denom + dx * dx)
            });

            if denom == 0.0 || mean_y <= 0.0 {
                return 0.0;
            }

            ((num / denom).abs() / mean_y).min(1.0)
        }
    }
}

/// Share of volume on the side the dominant flow trades into, rescaled so 0.5
/// maps to 0 and full one-sidedness to 1.
///
/// Buy-dominant flow lifts the ask, sell-dominant hits the bid; neutral uses the
/// larger side.
pub fn volume_concentration(sample: &PressureSample) -> f64 {
    let total = sample.total_volume();
    if total <= 0.0 {
        return 0.0;
    }

    let side_volume = match sample.dominant_side {
        DominantSide::Buy => sample.ask_volume,
        DominantSide::Sell => sample.bid_volume,
        DominantSide::Neutral => sample.ask_volume.max(sample.bid_volume),
    };

    ((side_volume / total - 0.5) * 2.0).clamp(0.0, 1.0)
}

pub fn time_persistence(history: &[f64], min_ratio: f64) -> f64 {
    if history.is_empty() {
        return 0.0;
    }

    let persistent = history.iter().filter(|&&ratio| ratio >= min_ratio).count();
    persistent as f64 / history.len() as f64
}
