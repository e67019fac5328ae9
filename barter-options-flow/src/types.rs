//! Core data types for options pressure samples and institutional signals
//!
//! Samples arrive from an external streaming collaborator; signals are produced
//! only by the [`SignalEngine`](crate::engine::SignalEngine).
use crate::{
    baseline::BaselineContext, confidence::ConfidenceBreakdown, error::FlowError,
    market_making::MarketMakingAnalysis,
};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option contract kind (Call or Put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    /// Convert to display / storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Call => "CALL",
            OptionKind::Put => "PUT",
        }
    }
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Side that dominated the traded volume in a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DominantSide {
    Buy,
    Sell,
    Neutral,
}

impl DominantSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            DominantSide::Buy => "BUY",
            DominantSide::Sell => "SELL",
            DominantSide::Neutral => "NEUTRAL",
        }
    }
}

/// Identity of a per-strike, per-kind series. Baselines, pressure history and
/// caches are all keyed by this.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, Constructor, Display,
)]
#[display("{strike} {kind}")]
pub struct ContractKey {
    pub strike: Decimal,
    pub kind: OptionKind,
}

/// Per-strike order-flow pressure sample
///
/// `window_start` is already truncated to the sampling granularity by the producer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PressureSample {
    pub strike: Decimal,
    pub option_kind: OptionKind,
    pub window_start: DateTime<Utc>,
    pub bid_volume: f64,
    pub ask_volume: f64,
    /// Directional imbalance between ask-side and bid-side volume
    pub pressure_ratio: f64,
    pub trade_count: u64,
    pub avg_trade_size: f64,
    pub dominant_side: DominantSide,
    /// Producer's own confidence in the sample, 0.0 - 1.0
    pub confidence: f64,
}

impl PressureSample {
    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.strike, self.option_kind)
    }

    /// Bid plus ask volume
    pub fn total_volume(&self) -> f64 {
        self.bid_volume + self.ask_volume
    }

    /// Reject samples with missing or nonsensical fields.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.strike <= Decimal::ZERO {
            return Err(FlowError::MalformedSample(format!(
                "non-positive strike {}",
                self.strike
            )));
        }

        let numeric = [
            ("bid_volume", self.bid_volume),
            ("ask_volume", self.ask_volume),
            ("pressure_ratio", self.pressure_ratio),
            ("avg_trade_size", self.avg_trade_size),
        ];
        for (field, value) in numeric {
            if !value.is_finite() || value < 0.0 {
                return Err(FlowError::MalformedSample(format!(
                    "{field} must be finite and non-negative, got {value}"
                )));
            }
        }

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(FlowError::MalformedSample(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }

        Ok(())
    }
}

/// Discrete classification of final signal confidence.
///
/// Ordering follows strength: `Moderate < High < VeryHigh < Extreme`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrengthTier {
    Moderate,
    High,
    VeryHigh,
    Extreme,
}

impl StrengthTier {
    pub const ALL: [StrengthTier; 4] = [
        StrengthTier::Moderate,
        StrengthTier::High,
        StrengthTier::VeryHigh,
        StrengthTier::Extreme,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StrengthTier::Moderate => "MODERATE",
            StrengthTier::High => "HIGH",
            StrengthTier::VeryHigh => "VERY_HIGH",
            StrengthTier::Extreme => "EXTREME",
        }
    }
}

impl std::fmt::Display for StrengthTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Recommended action attached to a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Monitor,
    Buy,
    StrongBuy,
}

impl SignalAction {
    pub fn label(&self) -> &'static str {
        match self {
            SignalAction::Monitor => "MONITOR",
            SignalAction::Buy => "BUY",
            SignalAction::StrongBuy => "STRONG_BUY",
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Risk fields derived from the final confidence and market-making score
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SignalRisk {
    /// 0.0 (low) - 1.0 (high)
    pub risk_score: f64,
    pub position_size_multiplier: f64,
    /// Fraction of capital at risk for a position sized from this signal
    pub max_position_risk: f64,
}

/// Fully-populated institutional activity signal
///
/// Created only by the signal engine and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstitutionalSignal {
    pub strike: Decimal,
    pub option_kind: OptionKind,
    pub timestamp: DateTime<Utc>,

    // Raw pressure fields copied from the sample
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub pressure_ratio: f64,
    pub trade_count: u64,
    pub avg_trade_size: f64,
    pub dominant_side: DominantSide,
    pub sample_confidence: f64,

    pub baseline: BaselineContext,
    pub market_making: MarketMakingAnalysis,
    pub confidence: ConfidenceBreakdown,

    pub strength: StrengthTier,
    pub action: SignalAction,
    pub risk: SignalRisk,
}

impl InstitutionalSignal {
    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.strike, self.option_kind)
    }

    /// Shorthand for `confidence.final_confidence`
    pub fn final_confidence(&self) -> f64 {
        self.confidence.final_confidence
    }

    pub fn total_volume(&self) -> f64 {
        self.bid_volume + self.ask_volume
    }
}
