//! Multi-factor confidence scoring.
//!
//! final = (raw * 0.4 + baseline * 0.3) * (1 - mm_penalty * 0.2) + coord_bonus * 0.1
//!
//! Every component is clamped before use so upstream bugs producing values
//! outside `[0, 1]` can never push the final confidence out of range.

use crate::{
    baseline::BaselineContext,
    config::ConfidenceWeights,
    market_making::MarketMakingAnalysis,
    pressure::PressureAnalysis,
    types::{SignalAction, SignalRisk, StrengthTier},
};
use serde::{Deserialize, Serialize};

const MAX_COORDINATION_BONUS: f64 = 0.2;
const BASE_POSITION_RISK: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ConfidenceBreakdown {
    pub raw: f64,
    pub baseline: f64,
    pub market_making_penalty: f64,
    pub coordination_bonus: f64,
    pub final_confidence: f64,
}

/// Map `value` into `[0, 1]`, treating NaN as 0.
fn unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConfidenceScorer {
    weights: ConfidenceWeights,
}

impl ConfidenceScorer {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }

    pub fn score(
        &self,
        pressure: &PressureAnalysis,
        baseline: &BaselineContext,
        market_making: &MarketMakingAnalysis,
    ) -> ConfidenceBreakdown {
        let raw = self.raw_confidence(pressure);
        let baseline = baseline_confidence(baseline);
        let market_making_penalty = unit(market_making.market_making_score);
        let coordination_bonus =
            (unit(pressure.cluster_coordination) * 0.2).min(MAX_COORDINATION_BONUS);

        ConfidenceBreakdown {
            raw,
            baseline,
            market_making_penalty,
            coordination_bonus,
            final_confidence: final_confidence(raw, baseline, market_making_penalty, coordination_bonus),
        }
    }

    /// Weighted sum of the pressure sub-scores.
    pub fn raw_confidence(&self, pressure: &PressureAnalysis) -> f64 {
        let w = &self.weights;
        unit(
            w.significance * unit(pressure.pressure_significance)
                + w.trend * unit(pressure.trend_strength)
                + w.concentration * unit(pressure.volume_concentration)
                + w.persistence * unit(pressure.time_persistence),
        )
    }
}

/// 0.5 without an anomaly, otherwise z-score and percentile rank blended and
/// scaled by the baseline's data quality.
pub fn baseline_confidence(context: &BaselineContext) -> f64 {
    if !context.anomaly_detected {
        return 0.5;
    }

    let z_component = (context.z_score.abs() / 4.0).min(1.0);
    let rank_component = unit(context.percentile_rank / 100.0);
    unit((0.5 * unit(z_component) + 0.5 * rank_component) * unit(context.data_quality))
}

/// Combine the components into the final confidence, always within `[0, 1]`.
pub fn final_confidence(raw: f64, baseline: f64, mm_penalty: f64, coordination_bonus: f64) -> f64 {
    let base = unit(raw) * 0.4 + unit(baseline) * 0.3;
    let penalised = base * (1.0 - unit(mm_penalty) * 0.2);
    unit(penalised + coordination_bonus.clamp(0.0, MAX_COORDINATION_BONUS) * 0.1)
}

/// Step function from final confidence to tier, action and position multiplier.
pub fn classify(final_confidence: f64) -> (StrengthTier, SignalAction, f64) {
    if final_confidence >= 0.9 {
        (StrengthTier::Extreme, SignalAction::StrongBuy, 3.0)
    } else if final_confidence >= 0.8 {
        (StrengthTier::VeryHigh, SignalAction::Buy, 2.0)
    } else if final_confidence >= 0.7 {
        (StrengthTier::High, SignalAction::Buy, 1.5)
    } else {
        (StrengthTier::Moderate, SignalAction::Monitor, 1.0)
    }
}

/// Risk grows as confidence falls and as market-making likelihood rises.
pub fn signal_risk(confidence: &ConfidenceBreakdown, position_size_multiplier: f64) -> SignalRisk {
    SignalRisk {
        risk_score: unit(0.5 * (1.0 - confidence.final_confidence) + 0.5 * confidence.market_making_penalty),
        position_size_multiplier,
        max_position_risk: BASE_POSITION_RISK * position_size_multiplier,
    }
}
