//! Per-sample signal engine.
//!
//! Each sample moves through
//! `Idle -> BaselineUpdated -> PressureAnalyzed -> MarketMakingChecked -> Scored`
//! and ends either `Emitted` or `Suppressed`. Errors at any stage suppress the
//! sample and are logged with its key; nothing is raised past
//! [`SignalEngine::process_sample`].

use crate::{
    baseline::{BaselineContext, BaselineStorage, BaselineStore},
    clock::Clock,
    confidence::{self, ConfidenceScorer},
    config::SignalConfig,
    error::FlowError,
    market_making::{FilterRecommendation, MarketMakingAnalysis, MarketMakingDetector},
    pressure::{PressureAnalysis, PressureAnalyzer},
    types::{InstitutionalSignal, OptionKind, PressureSample, SignalAction, StrengthTier},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::VecDeque, sync::Arc};
use tracing::{debug, warn};

/// Stage a sample has reached in the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, derive_more::Display)]
pub enum PipelineStage {
    Idle,
    BaselineUpdated,
    PressureAnalyzed,
    MarketMakingChecked,
    Scored,
    Emitted,
    Suppressed,
}

/// Why a sample produced no signal
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Suppression {
    LowActivity { volume: f64, confidence: f64 },
    BelowThreshold { confidence: f64 },
    MarketMaking { score: f64 },
}

/// Emitted signal, or the reason there is none.
pub(crate) type Evaluation = Result<InstitutionalSignal, Suppression>;

/// Brief view of an emitted signal for summaries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalActivity {
    pub strike: Decimal,
    pub option_kind: OptionKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub strength: StrengthTier,
    pub action: SignalAction,
}

impl From<&InstitutionalSignal> for SignalActivity {
    fn from(signal: &InstitutionalSignal) -> Self {
        Self {
            strike: signal.strike,
            option_kind: signal.option_kind,
            timestamp: signal.timestamp,
            confidence: signal.final_confidence(),
            strength: signal.strength,
            action: signal.action,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineSummary {
    /// Signals emitted since the engine started
    pub total_signals: u64,
    /// Mean final confidence over the recent-signal buffer
    pub avg_confidence: f64,
    /// Strength tier counts over the recent-signal buffer
    pub distribution: BTreeMap<StrengthTier, usize>,
    /// Newest last
    pub last_5: Vec<SignalActivity>,
    pub samples_processed: u64,
    pub samples_suppressed: u64,
    pub analysis_errors: u64,
    pub baseline_degraded: bool,
    /// (strike, kind) series held by the pressure analyzer
    pub tracked_contracts: usize,
    /// Strikes with recent activity held by the market-making detector
    pub tracked_strikes: usize,
    pub cached_baselines: usize,
    pub pending_baseline_rows: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EngineCounters {
    pub processed: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub errors: u64,
}

pub struct SignalEngine<S> {
    config: SignalConfig,
    baseline: BaselineStore<S>,
    pressure: PressureAnalyzer,
    market_making: MarketMakingDetector,
    scorer: ConfidenceScorer,
    recent: VecDeque<InstitutionalSignal>,
    counters: EngineCounters,
}

impl<S> std::fmt::Debug for SignalEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalEngine")
            .field("baseline", &self.baseline)
            .field("recent", &self.recent.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl<S: BaselineStorage> SignalEngine<S> {
    pub fn new(config: SignalConfig, storage: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            baseline: BaselineStore::new(storage, config.baseline.clone(), clock),
            pressure: PressureAnalyzer::new(config.pressure.clone()),
            market_making: MarketMakingDetector::new(config.market_making.clone()),
            scorer: ConfidenceScorer::new(config.weights),
            recent: VecDeque::with_capacity(config.recent_signal_capacity),
            counters: EngineCounters::default(),
            config,
        }
    }

    /// Run one sample through the pipeline. Returns `None` when the sample is
    /// malformed, below a threshold, or analysis failed.
    pub fn process_sample(&mut self, sample: &PressureSample) -> Option<InstitutionalSignal> {
        self.counters.processed += 1;

        let mut stage = PipelineStage::Idle;
        let result = self.try_process(sample, &mut stage);
        self.conclude(sample, stage, result)
    }

    fn try_process(
        &mut self,
        sample: &PressureSample,
        stage: &mut PipelineStage,
    ) -> Result<Evaluation, FlowError> {
        sample.validate()?;

        let context = self.baseline.context(&sample.key());
        self.baseline.record(sample);
        *stage = PipelineStage::BaselineUpdated;

        if let Some(suppression) = activity_gate(&self.config, sample) {
            return Ok(Err(suppression));
        }

        let pressure = self.pressure.analyze(sample);
        *stage = PipelineStage::PressureAnalyzed;

        let market_making = self.market_making.detect(sample);
        *stage = PipelineStage::MarketMakingChecked;

        let evaluation = evaluate(&self.config, &self.scorer, sample, &context, &pressure, market_making)?;
        *stage = PipelineStage::Scored;
        Ok(evaluation)
    }

    /// Log the outcome, update counters and the recent buffer.
    pub(crate) fn conclude(
        &mut self,
        sample: &PressureSample,
        stage: PipelineStage,
        result: Result<Evaluation, FlowError>,
    ) -> Option<InstitutionalSignal> {
        match result {
            Ok(Ok(signal)) => {
                debug!(
                    strike = %signal.strike,
                    kind = %signal.option_kind,
                    side = signal.dominant_side.as_str(),
                    confidence = signal.final_confidence(),
                    strength = %signal.strength,
                    "institutional signal emitted"
                );
                self.push_recent(signal.clone());
                Some(signal)
            }
            Ok(Err(suppression)) => {
                self.counters.suppressed += 1;
                debug!(
                    strike = %sample.strike,
                    kind = %sample.option_kind,
                    ?suppression,
                    "sample suppressed"
                );
                None
            }
            Err(error) => {
                self.counters.suppressed += 1;
                self.counters.errors += 1;
                warn!(
                    strike = %sample.strike,
                    kind = %sample.option_kind,
                    window_start = %sample.window_start,
                    %stage,
                    %error,
                    "sample analysis failed, suppressed"
                );
                None
            }
        }
    }

    fn push_recent(&mut self, signal: InstitutionalSignal) {
        self.counters.emitted += 1;
        if self.recent.len() >= self.config.recent_signal_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(signal);
    }

    /// Up to `n` most recent emitted signals, oldest first.
    pub fn recent_signals(&self, n: usize) -> Vec<InstitutionalSignal> {
        let start = self.recent.len().saturating_sub(n);
        self.recent.range(start..).cloned().collect()
    }

    pub fn summary(&self) -> EngineSummary {
        let avg_confidence = if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().map(InstitutionalSignal::final_confidence).sum::<f64>()
                / self.recent.len() as f64
        };

        let mut distribution: BTreeMap<StrengthTier, usize> =
            StrengthTier::ALL.iter().map(|tier| (*tier, 0)).collect();
        for signal in &self.recent {
            *distribution.entry(signal.strength).or_default() += 1;
        }

        let start = self.recent.len().saturating_sub(5);
        let last_5 = self.recent.range(start..).map(SignalActivity::from).collect();

        EngineSummary {
            total_signals: self.counters.emitted,
            avg_confidence,
            distribution,
            last_5,
            samples_processed: self.counters.processed,
            samples_suppressed: self.counters.suppressed,
            analysis_errors: self.counters.errors,
            baseline_degraded: self.baseline.is_degraded(),
            tracked_contracts: self.pressure.tracked_contracts(),
            tracked_strikes: self.market_making.tracked_strikes(),
            cached_baselines: self.baseline.cached_len(),
            pending_baseline_rows: self.baseline.pending_len(),
        }
    }

    /// False while baseline storage is failing and neutral baselines are in use.
    pub fn baseline_available(&self) -> bool {
        !self.baseline.is_degraded()
    }

    /// Name of the baseline storage backend.
    pub fn baseline_backend(&self) -> &'static str {
        self.baseline.storage().backend_type()
    }

    /// Persist any buffered baseline rows.
    pub fn flush(&mut self) -> Result<usize, FlowError> {
        self.baseline.flush()
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (
        &SignalConfig,
        &mut BaselineStore<S>,
        &mut PressureAnalyzer,
        &mut MarketMakingDetector,
        &ConfidenceScorer,
    ) {
        (
            &self.config,
            &mut self.baseline,
            &mut self.pressure,
            &mut self.market_making,
            &self.scorer,
        )
    }

    pub(crate) fn count_processed(&mut self, n: u64) {
        self.counters.processed += n;
    }
}

/// Samples too thin to carry information are suppressed before analysis.
pub(crate) fn activity_gate(config: &SignalConfig, sample: &PressureSample) -> Option<Suppression> {
    let volume = sample.total_volume();
    if volume < config.min_volume || sample.confidence < config.min_sample_confidence {
        Some(Suppression::LowActivity {
            volume,
            confidence: sample.confidence,
        })
    } else {
        None
    }
}

/// Score a fully analysed sample and build the signal if it passes the gates.
pub(crate) fn evaluate(
    config: &SignalConfig,
    scorer: &ConfidenceScorer,
    sample: &PressureSample,
    context: &BaselineContext,
    pressure: &PressureAnalysis,
    market_making: MarketMakingAnalysis,
) -> Result<Evaluation, FlowError> {
    let baseline = context.apply_current(sample.pressure_ratio);
    let breakdown = scorer.score(pressure, &baseline, &market_making);

    if !breakdown.final_confidence.is_finite() || !baseline.z_score.is_finite() {
        return Err(FlowError::Analysis(format!(
            "non-finite score (confidence {}, z-score {})",
            breakdown.final_confidence, baseline.z_score
        )));
    }

    if config.drop_rejected_market_making && market_making.filter == FilterRecommendation::Reject {
        return Ok(Err(Suppression::MarketMaking {
            score: market_making.market_making_score,
        }));
    }

    if breakdown.final_confidence < config.min_confidence {
        return Ok(Err(Suppression::BelowThreshold {
            confidence: breakdown.final_confidence,
        }));
    }

    let (strength, action, multiplier) = confidence::classify(breakdown.final_confidence);
    let risk = confidence::signal_risk(&breakdown, multiplier);

    Ok(Ok(InstitutionalSignal {
        strike: sample.strike,
        option_kind: sample.option_kind,
        timestamp: sample.window_start,
        bid_volume: sample.bid_volume,
        ask_volume: sample.ask_volume,
        pressure_ratio: sample.pressure_ratio,
        trade_count: sample.trade_count,
        avg_trade_size: sample.avg_trade_size,
        dominant_side: sample.dominant_side,
        sample_confidence: sample.confidence,
        baseline,
        market_making,
        confidence: breakdown,
        strength,
        action,
        risk,
    }))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::{
        baseline::{HistoricalRow, MemoryBaselineStorage},
        clock::ManualClock,
        types::ContractKey,
    };
    use chrono::TimeDelta;

    /// Storage pre-loaded with 20 days of calm history (ratio ~1.5) for `keys`,
    /// ending the day before `now`.
    pub fn seeded_storage(keys: &[ContractKey], now: DateTime<Utc>) -> MemoryBaselineStorage {
        let mut storage = MemoryBaselineStorage::new();
        let rows: Vec<HistoricalRow> = keys
            .iter()
            .flat_map(|key| {
                (1..=20).map(move |day| HistoricalRow {
                    key: *key,
                    date: (now - TimeDelta::days(day)).date_naive(),
                    pressure_ratio: 1.5 + if day % 2 == 0 { 0.25 } else { -0.25 },
                    volume: 800.0,
                    confidence: 0.9,
                })
            })
            .collect();
        storage.upsert_rows(&rows).expect("memory storage never fails");
        storage
    }

    pub fn engine(
        config: SignalConfig,
        keys: &[ContractKey],
        now: DateTime<Utc>,
    ) -> SignalEngine<MemoryBaselineStorage> {
        SignalEngine::new(config, seeded_storage(keys, now), Arc::new(ManualClock::new(now)))
    }

    /// A sample that clears every gate against [`seeded_storage`] history.
    pub fn strong_sample(key: ContractKey, window_start: DateTime<Utc>) -> PressureSample {
        PressureSample {
            strike: key.strike,
            option_kind: key.kind,
            window_start,
            bid_volume: 50.0,
            ask_volume: 1_950.0,
            pressure_ratio: 8.0,
            trade_count: 120,
            avg_trade_size: 16.7,
            dominant_side: crate::types::DominantSide::Buy,
            confidence: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_utils::*, *};
    use crate::{
        baseline::{HistoricalRow, MemoryBaselineStorage},
        clock::ManualClock,
        types::{ContractKey, test_utils::time},
    };
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn call() -> ContractKey {
        ContractKey::new(dec!(450), OptionKind::Call)
    }

    #[test]
    fn test_strong_sample_emits_signal() {
        let mut engine = engine(SignalConfig::default(), &[call()], time(14, 30, 0));

        let signal = engine
            .process_sample(&strong_sample(call(), time(14, 30, 0)))
            .expect("signal emitted");

        assert_eq!(signal.key(), call());
        assert_eq!(signal.timestamp, time(14, 30, 0));
        assert!(signal.baseline.anomaly_detected);
        assert!(signal.baseline.z_score > 2.0);
        assert!(signal.final_confidence() >= 0.6);
        assert!(signal.final_confidence() <= 1.0);
        assert_eq!(signal.strength, StrengthTier::Moderate);
        assert_eq!(signal.action, SignalAction::Monitor);
        assert_eq!(signal.risk.position_size_multiplier, 1.0);
        assert!((signal.risk.max_position_risk - 0.02).abs() < 1e-9);
        assert_eq!(signal.market_making.filter, FilterRecommendation::Accept);
        assert_eq!(engine.recent_signals(10).len(), 1);
        assert!(engine.baseline_available());
    }

    #[test]
    fn test_weak_sample_suppressed() {
        let mut engine = engine(SignalConfig::default(), &[call()], time(14, 30, 0));
        let sample = PressureSample {
            pressure_ratio: 1.5,
            bid_volume: 500.0,
            ask_volume: 500.0,
            confidence: 0.6,
            ..strong_sample(call(), time(14, 30, 0))
        };

        assert!(engine.process_sample(&sample).is_none());

        let summary = engine.summary();
        assert_eq!(summary.samples_processed, 1);
        assert_eq!(summary.samples_suppressed, 1);
        assert_eq!(summary.total_signals, 0);
        assert_eq!(summary.analysis_errors, 0);
        assert_eq!(summary.tracked_contracts, 1);
        assert_eq!(summary.cached_baselines, 1);
        assert_eq!(summary.pending_baseline_rows, 1);
        assert_eq!(engine.baseline_backend(), "Memory");
    }

    #[test]
    fn test_low_activity_gate() {
        let mut engine = engine(SignalConfig::default(), &[call()], time(14, 30, 0));
        let sample = PressureSample {
            bid_volume: 5.0,
            ask_volume: 20.0,
            ..strong_sample(call(), time(14, 30, 0))
        };

        assert!(engine.process_sample(&sample).is_none());
        assert_eq!(engine.summary().samples_suppressed, 1);
    }

    #[test]
    fn test_malformed_sample_returns_none_and_counts_error() {
        let mut engine = engine(SignalConfig::default(), &[call()], time(14, 30, 0));
        let sample = PressureSample {
            pressure_ratio: f64::NAN,
            ..strong_sample(call(), time(14, 30, 0))
        };

        assert!(engine.process_sample(&sample).is_none());
        assert_eq!(engine.summary().analysis_errors, 1);
    }

    #[test]
    fn test_no_history_scores_neutral_baseline() {
        let now = time(14, 30, 0);
        let mut engine = SignalEngine::new(
            SignalConfig::default(),
            MemoryBaselineStorage::new(),
            Arc::new(ManualClock::new(now)),
        );

        // Neutral baseline carries no anomaly weight: below the 0.6 gate
        assert!(engine.process_sample(&strong_sample(call(), now)).is_none());

        let mut engine = SignalEngine::new(
            SignalConfig::default().with_min_confidence(0.3),
            MemoryBaselineStorage::new(),
            Arc::new(ManualClock::new(now)),
        );
        let signal = engine.process_sample(&strong_sample(call(), now)).expect("signal");
        assert_eq!(signal.baseline.data_quality, 0.0);
        assert_eq!(signal.confidence.baseline, 0.0);
    }

    #[test]
    fn test_live_sample_not_counted_as_own_history() {
        let now = time(14, 30, 0);
        let rows: Vec<HistoricalRow> = (1..=4)
            .map(|day| HistoricalRow {
                key: call(),
                date: (now - chrono::TimeDelta::days(day)).date_naive(),
                pressure_ratio: 1.5,
                volume: 800.0,
                confidence: 0.9,
            })
            .collect();
        let mut storage = MemoryBaselineStorage::new();
        storage.upsert_rows(&rows).unwrap();
        let mut engine = SignalEngine::new(
            SignalConfig::default().with_min_confidence(0.0),
            storage,
            Arc::new(ManualClock::new(now)),
        );

        let signal = engine.process_sample(&strong_sample(call(), now)).expect("signal");

        // 4 prior rows is below the minimum: neutral baseline, ratio 8 is 13 std devs out
        assert_eq!(signal.baseline.history_rows, 0);
        assert_eq!(signal.baseline.mean, 1.5);
        assert_eq!(signal.baseline.data_quality, 0.0);
        assert!((signal.baseline.z_score - 13.0).abs() < 1e-9);
        assert!(signal.baseline.anomaly_detected);

        // A later sample the same day still sees only the prior days
        let later = engine
            .process_sample(&strong_sample(call(), time(14, 35, 0)))
            .expect("signal");
        assert_eq!(later.baseline.history_rows, 0);
    }

    #[test]
    fn test_coordinated_straddle_dropped_when_gate_enabled() {
        let put = ContractKey::new(dec!(450), OptionKind::Put);
        let config = SignalConfig {
            drop_rejected_market_making: true,
            ..SignalConfig::default()
        };
        let mut engine = engine(config, &[call(), put], time(14, 30, 0));

        assert!(engine.process_sample(&strong_sample(call(), time(14, 30, 0))).is_some());
        assert!(engine.process_sample(&strong_sample(put, time(14, 30, 0))).is_none());
    }

    #[test]
    fn test_recent_signals_ring_buffer_bounded() {
        // Repeated ratios flatten the trend score, so relax the gate
        let config = SignalConfig {
            recent_signal_capacity: 3,
            ..SignalConfig::default().with_min_confidence(0.5)
        };
        let mut engine = engine(config, &[call()], time(14, 30, 0));

        for minute in 0..5 {
            engine.process_sample(&strong_sample(call(), time(14, 30 + minute, 0)));
        }

        let recent = engine.recent_signals(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp, time(14, 32, 0));
        assert_eq!(recent[2].timestamp, time(14, 34, 0));
        assert_eq!(engine.recent_signals(1)[0].timestamp, time(14, 34, 0));

        let summary = engine.summary();
        assert_eq!(summary.total_signals, 5);
        assert_eq!(summary.last_5.len(), 3);
        assert_eq!(summary.distribution.values().sum::<usize>(), 3);
        assert_eq!(summary.distribution[&StrengthTier::Extreme], 0);
        assert!(summary.avg_confidence >= 0.5);
    }

    #[test]
    fn test_baseline_rows_persisted_on_flush() {
        let now = time(14, 30, 0);
        let mut engine = engine(SignalConfig::default(), &[call()], now);

        engine.process_sample(&strong_sample(call(), now));
        engine.flush().expect("flush");

        let (_, baseline, ..) = engine.parts_mut();
        let rows: Vec<HistoricalRow> = baseline
            .storage()
            .rows_since(&call(), NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pressure_ratio, 8.0);
    }
}
