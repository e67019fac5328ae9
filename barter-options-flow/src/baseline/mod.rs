//! Historical pressure-ratio baselines.
//!
//! A [`BaselineContext`] answers "how unusual is this pressure ratio for this
//! strike today?" from a rolling N-day history held in a [`BaselineStorage`].

use crate::types::{ContractKey, OptionKind};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod storage;
pub mod store;

pub use storage::{BaselineStorage, MemoryBaselineStorage, SqliteBaselineStorage};
pub use store::BaselineStore;

/// Percentiles tracked for every baseline
pub const TRACKED_PERCENTILES: [u8; 8] = [5, 10, 25, 50, 75, 90, 95, 99];

/// Rank reported when the ratio exceeds every tracked percentile
pub const TOP_PERCENTILE_RANK: f64 = 99.0;

pub const ANOMALY_Z_SCORE: f64 = 2.0;
pub const ANOMALY_PERCENTILE_RANK: f64 = 95.0;

const NEUTRAL_MEAN: f64 = 1.5;
const NEUTRAL_STD_DEV: f64 = 0.5;

/// z-score quantiles of the standard normal matching [`TRACKED_PERCENTILES`]
const NORMAL_QUANTILES: [f64; 8] = [
    -1.6449, -1.2816, -0.6745, 0.0, 0.6745, 1.2816, 1.6449, 2.3263,
];

/// Anomaly rule shared by every baseline.
pub fn is_anomalous(z_score: f64, percentile_rank: f64) -> bool {
    z_score.abs() >= ANOMALY_Z_SCORE || percentile_rank >= ANOMALY_PERCENTILE_RANK
}

/// One day of history for a (strike, kind). Idempotent per calendar day.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistoricalRow {
    pub key: ContractKey,
    pub date: NaiveDate,
    pub pressure_ratio: f64,
    pub volume: f64,
    pub confidence: f64,
}

/// Precomputed distribution statistics for a (strike, kind, lookback) triple.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BaselineStats {
    pub key: ContractKey,
    pub lookback_days: u32,
    pub mean: f64,
    pub std_dev: f64,
    pub percentiles: BTreeMap<u8, f64>,
    pub row_count: usize,
    pub avg_confidence: f64,
    pub computed_at: DateTime<Utc>,
}

impl BaselineStats {
    /// Compute statistics from historical rows. Returns `None` for empty input.
    pub fn from_rows(
        key: ContractKey,
        lookback_days: u32,
        rows: &[HistoricalRow],
        computed_at: DateTime<Utc>,
    ) -> Option<Self> {
        if rows.is_empty() {
            return None;
        }

        let mut ratios: Vec<f64> = rows.iter().map(|row| row.pressure_ratio).collect();
        ratios.sort_by(f64::total_cmp);

        let n = ratios.len() as f64;
        let mean = ratios.iter().sum::<f64>() / n;
        let std_dev = if ratios.len() < 2 {
            0.0
        } else {
            let variance = ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
            variance.sqrt()
        };

        let percentiles = TRACKED_PERCENTILES
            .iter()
            .map(|&p| (p, interpolate_percentile(&ratios, p as f64)))
            .collect();

        let avg_confidence = rows.iter().map(|row| row.confidence).sum::<f64>() / n;

        Some(Self {
            key,
            lookback_days,
            mean,
            std_dev,
            percentiles,
            row_count: rows.len(),
            avg_confidence,
            computed_at,
        })
    }
}

/// Linear interpolation between closest ranks; `sorted` must be ascending and non-empty.
fn interpolate_percentile(sorted: &[f64], percentile: f64) -> f64 {
    let position = (percentile / 100.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Statistical context of a (strike, kind) pressure ratio against its history
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BaselineContext {
    pub strike: Decimal,
    pub option_kind: OptionKind,
    pub lookback_days: u32,
    pub mean: f64,
    pub std_dev: f64,
    /// Percentile -> ratio value, ordered by percentile
    pub percentiles: BTreeMap<u8, f64>,
    pub z_score: f64,
    pub percentile_rank: f64,
    pub anomaly_detected: bool,
    /// Fraction of expected history present, 0.0 - 1.0
    pub data_quality: f64,
    /// Trust in the baseline itself, 0.0 - 1.0
    pub confidence: f64,
    pub history_rows: usize,
}

impl BaselineContext {
    /// Fixed default used when history is missing or storage is unavailable.
    ///
    /// Percentiles are those of a normal distribution with the default mean and
    /// standard deviation so the rank remains meaningful.
    pub fn neutral(key: ContractKey, lookback_days: u32) -> Self {
        let percentiles = TRACKED_PERCENTILES
            .iter()
            .zip(NORMAL_QUANTILES)
            .map(|(&p, z)| (p, NEUTRAL_MEAN + z * NEUTRAL_STD_DEV))
            .collect();

        Self {
            strike: key.strike,
            option_kind: key.kind,
            lookback_days,
            mean: NEUTRAL_MEAN,
            std_dev: NEUTRAL_STD_DEV,
            percentiles,
            z_score: 0.0,
            percentile_rank: 50.0,
            anomaly_detected: false,
            data_quality: 0.0,
            confidence: 0.0,
            history_rows: 0,
        }
    }

    /// Build a context from precomputed statistics.
    pub fn from_stats(stats: &BaselineStats) -> Self {
        let expected = stats.lookback_days.max(1) as f64;
        let data_quality = (stats.row_count as f64 / expected).min(1.0);
        let confidence = (0.7 * data_quality + 0.3 * stats.avg_confidence).clamp(0.0, 1.0);

        Self {
            strike: stats.key.strike,
            option_kind: stats.key.kind,
            lookback_days: stats.lookback_days,
            mean: stats.mean,
            std_dev: stats.std_dev,
            percentiles: stats.percentiles.clone(),
            z_score: 0.0,
            percentile_rank: 50.0,
            anomaly_detected: false,
            data_quality,
            confidence,
            history_rows: stats.row_count,
        }
    }

    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.strike, self.option_kind)
    }

    /// Evaluate the current ratio against this baseline.
    ///
    /// z-score is `(ratio - mean) / std` (0 when std is 0). Percentile rank is the
    /// first tracked percentile whose value is >= ratio, or 99 if none is.
    pub fn apply_current(&self, ratio: f64) -> Self {
        let z_score = if self.std_dev > 0.0 && self.std_dev.is_finite() {
            (ratio - self.mean) / self.std_dev
        } else {
            0.0
        };

        let percentile_rank = self
            .percentiles
            .iter()
            .find(|&(_, &value)| value >= ratio)
            .map(|(&p, _)| p as f64)
            .unwrap_or(TOP_PERCENTILE_RANK);

        Self {
            z_score,
            percentile_rank,
            anomaly_detected: is_anomalous(z_score, percentile_rank),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn key() -> ContractKey {
        ContractKey::new(dec!(450), OptionKind::Call)
    }

    fn rows(ratios: &[f64]) -> Vec<HistoricalRow> {
        ratios
            .iter()
            .enumerate()
            .map(|(i, &ratio)| HistoricalRow {
                key: key(),
                date: NaiveDate::from_ymd_opt(2024, 3, 1 + i as u32).unwrap(),
                pressure_ratio: ratio,
                volume: 500.0,
                confidence: 0.8,
            })
            .collect()
    }

    #[test]
    fn test_apply_current_flags_anomaly_above_p95() {
        let mut context = BaselineContext::neutral(key(), 20);
        context.percentiles = BTreeMap::from([(50, 1.5), (90, 2.5), (95, 3.0), (99, 4.0)]);

        let applied = context.apply_current(3.0);

        assert!((applied.z_score - 3.0).abs() < 1e-9);
        assert!(applied.percentile_rank >= 95.0);
        assert!(applied.anomaly_detected);
    }

    #[test]
    fn test_apply_current_zero_std_yields_zero_z_score() {
        let mut context = BaselineContext::neutral(key(), 20);
        context.std_dev = 0.0;

        let applied = context.apply_current(10.0);

        assert_eq!(applied.z_score, 0.0);
        assert_eq!(applied.percentile_rank, TOP_PERCENTILE_RANK);
        assert!(applied.anomaly_detected);
    }

    #[test]
    fn test_neutral_context_is_not_anomalous() {
        let context = BaselineContext::neutral(key(), 20);

        assert_eq!(context.data_quality, 0.0);
        assert_eq!(context.confidence, 0.0);
        assert!(!context.anomaly_detected);

        let applied = context.apply_current(1.5);
        assert!(!applied.anomaly_detected);
        assert_eq!(applied.percentile_rank, 50.0);
    }

    #[test]
    fn test_anomaly_flag_matches_rule_for_ratio_grid() {
        let stats = BaselineStats::from_rows(
            key(),
            20,
            &rows(&[1.0, 1.2, 1.4, 1.5, 1.6, 1.9, 2.2, 2.4]),
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let context = BaselineContext::from_stats(&stats);

        for step in 0..200 {
            let ratio = step as f64 * 0.05;
            let applied = context.apply_current(ratio);
            assert_eq!(
                applied.anomaly_detected,
                applied.z_score.abs() >= 2.0 || applied.percentile_rank >= 95.0,
                "ratio {ratio}"
            );
        }
    }

    #[test]
    fn test_stats_from_rows() {
        let stats = BaselineStats::from_rows(
            key(),
            20,
            &rows(&[1.0, 2.0, 3.0, 4.0, 5.0]),
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap(),
        )
        .unwrap();

        assert_eq!(stats.row_count, 5);
        assert!((stats.mean - 3.0).abs() < 1e-9);
        // Sample std of 1..=5
        assert!((stats.std_dev - 1.5811).abs() < 1e-3);
        assert!((stats.percentiles[&50] - 3.0).abs() < 1e-9);
        assert!((stats.percentiles[&25] - 2.0).abs() < 1e-9);
        assert!((stats.percentiles[&99] - 4.96).abs() < 1e-9);

        let context = BaselineContext::from_stats(&stats);
        assert!((context.data_quality - 0.25).abs() < 1e-9);
        assert!((context.confidence - (0.7 * 0.25 + 0.3 * 0.8)).abs() < 1e-9);
    }

    #[test]
    fn test_stats_from_empty_rows() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert!(BaselineStats::from_rows(key(), 20, &[], now).is_none());
    }
}
