//! Pipeline configuration.
//!
//! Every knob has a default suitable for live trading hours; deployments tune
//! them through `FLOW_*` environment variables via [`SignalConfig::from_env`] and
//! [`AggregatorConfig::from_env`], or by deserialising the structs from JSON.

use crate::error::FlowError;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Read `key` from the environment, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn check_unit(name: &str, value: f64) -> Result<(), FlowError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FlowError::InvalidConfig(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

fn check_nonzero(name: &str, value: usize) -> Result<(), FlowError> {
    if value == 0 {
        Err(FlowError::InvalidConfig(format!("{name} must be non-zero")))
    } else {
        Ok(())
    }
}

/// Historical baseline settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BaselineConfig {
    /// Days of history used for mean / std / percentiles
    pub lookback_days: u32,
    /// Below this many historical rows the neutral default baseline is used
    pub min_history_rows: usize,
    /// Age after which a cached baseline is recomputed from storage
    pub cache_ttl_secs: i64,
    /// Pending same-day rows buffered before a storage write
    pub write_batch_size: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            lookback_days: 20,
            min_history_rows: 5,
            cache_ttl_secs: 60 * 60,
            write_batch_size: 50,
        }
    }
}

impl BaselineConfig {
    pub fn cache_ttl(&self) -> TimeDelta {
        TimeDelta::seconds(self.cache_ttl_secs)
    }
}

/// Real-time pressure analysis settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PressureConfig {
    /// Samples retained per (strike, kind)
    pub history_len: usize,
    /// Ratio at or above which a history point counts towards persistence
    pub min_pressure_ratio: f64,
    /// A series with no samples for this long is dropped and starts afresh
    pub idle_horizon_secs: i64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            history_len: 3,
            min_pressure_ratio: 2.0,
            idle_horizon_secs: 60 * 60,
        }
    }
}

/// Market-making (dealer hedging) detection settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarketMakingConfig {
    /// Max gap between call and put prints for them to count as one straddle
    pub straddle_time_window_secs: i64,
    /// How long per-strike activity is retained
    pub activity_horizon_secs: i64,
    /// Scores above this are REJECT, above 70% of it MONITOR
    pub max_mm_probability: f64,
    /// Constant used until option price-decline tracking exists
    pub volatility_crush_probability: f64,
}

impl Default for MarketMakingConfig {
    fn default() -> Self {
        Self {
            straddle_time_window_secs: 300,
            activity_horizon_secs: 300,
            max_mm_probability: 0.3,
            volatility_crush_probability: 0.1,
        }
    }
}

/// Weights applied to the pressure sub-scores when computing raw confidence
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ConfidenceWeights {
    pub significance: f64,
    pub trend: f64,
    pub concentration: f64,
    pub persistence: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            significance: 0.4,
            trend: 0.3,
            concentration: 0.2,
            persistence: 0.1,
        }
    }
}

/// Batch / parallel engine settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Batches smaller than this are processed sequentially
    pub parallel_threshold: usize,
    pub worker_threads: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 25,
            worker_threads: 4,
        }
    }
}

/// Signal engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalConfig {
    pub baseline: BaselineConfig,
    pub pressure: PressureConfig,
    pub market_making: MarketMakingConfig,
    pub weights: ConfidenceWeights,
    pub batch: BatchConfig,
    /// Samples with less total volume are suppressed before analysis
    pub min_volume: f64,
    /// Samples with lower producer confidence are suppressed before analysis
    pub min_sample_confidence: f64,
    /// Final confidence gate
    pub min_confidence: f64,
    /// Capacity of the recent-signal ring buffer
    pub recent_signal_capacity: usize,
    /// Suppress signals whose market-making filter says REJECT
    pub drop_rejected_market_making: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            baseline: BaselineConfig::default(),
            pressure: PressureConfig::default(),
            market_making: MarketMakingConfig::default(),
            weights: ConfidenceWeights::default(),
            batch: BatchConfig::default(),
            min_volume: 100.0,
            min_sample_confidence: 0.5,
            min_confidence: 0.6,
            recent_signal_capacity: 100,
            drop_rejected_market_making: false,
        }
    }
}

impl SignalConfig {
    /// Defaults overridden by `FLOW_*` environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            baseline: BaselineConfig {
                lookback_days: env_or("FLOW_LOOKBACK_DAYS", d.baseline.lookback_days),
                min_history_rows: env_or("FLOW_MIN_HISTORY_ROWS", d.baseline.min_history_rows),
                cache_ttl_secs: env_or("FLOW_BASELINE_CACHE_TTL_SECS", d.baseline.cache_ttl_secs),
                write_batch_size: env_or("FLOW_BASELINE_WRITE_BATCH", d.baseline.write_batch_size),
            },
            pressure: PressureConfig {
                history_len: env_or("FLOW_PRESSURE_HISTORY", d.pressure.history_len),
                min_pressure_ratio: env_or("FLOW_MIN_PRESSURE_RATIO", d.pressure.min_pressure_ratio),
                idle_horizon_secs: env_or("FLOW_PRESSURE_IDLE_SECS", d.pressure.idle_horizon_secs),
            },
            market_making: MarketMakingConfig {
                straddle_time_window_secs: env_or(
                    "FLOW_STRADDLE_WINDOW_SECS",
                    d.market_making.straddle_time_window_secs,
                ),
                activity_horizon_secs: env_or(
                    "FLOW_MM_ACTIVITY_HORIZON_SECS",
                    d.market_making.activity_horizon_secs,
                ),
                max_mm_probability: env_or(
                    "FLOW_MAX_MM_PROBABILITY",
                    d.market_making.max_mm_probability,
                ),
                volatility_crush_probability: d.market_making.volatility_crush_probability,
            },
            weights: d.weights,
            batch: BatchConfig {
                parallel_threshold: env_or("FLOW_PARALLEL_THRESHOLD", d.batch.parallel_threshold),
                worker_threads: env_or("FLOW_WORKER_THREADS", d.batch.worker_threads),
            },
            min_volume: env_or("FLOW_MIN_VOLUME", d.min_volume),
            min_sample_confidence: env_or("FLOW_MIN_SAMPLE_CONFIDENCE", d.min_sample_confidence),
            min_confidence: env_or("FLOW_MIN_CONFIDENCE", d.min_confidence),
            recent_signal_capacity: env_or("FLOW_RECENT_SIGNALS", d.recent_signal_capacity),
            drop_rejected_market_making: env_or(
                "FLOW_DROP_REJECTED_MM",
                d.drop_rejected_market_making,
            ),
        }
    }

    /// Set the final confidence gate
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Set the baseline lookback in days
    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.baseline.lookback_days = days;
        self
    }

    /// Set the market-making score ceiling
    pub fn with_max_mm_probability(mut self, max: f64) -> Self {
        self.market_making.max_mm_probability = max;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.batch.worker_threads = threads;
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.batch.parallel_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.baseline.lookback_days == 0 {
            return Err(FlowError::InvalidConfig("lookback_days must be non-zero".into()));
        }
        if self.baseline.cache_ttl_secs < 0 {
            return Err(FlowError::InvalidConfig("cache_ttl_secs must be >= 0".into()));
        }
        check_nonzero("write_batch_size", self.baseline.write_batch_size)?;
        check_nonzero("history_len", self.pressure.history_len)?;
        check_nonzero("recent_signal_capacity", self.recent_signal_capacity)?;
        check_nonzero("worker_threads", self.batch.worker_threads)?;
        if self.pressure.idle_horizon_secs <= 0 {
            return Err(FlowError::InvalidConfig("idle_horizon_secs must be positive".into()));
        }
        if self.market_making.activity_horizon_secs <= 0 {
            return Err(FlowError::InvalidConfig("activity_horizon_secs must be positive".into()));
        }
        if self.market_making.straddle_time_window_secs <= 0 {
            return Err(FlowError::InvalidConfig(
                "straddle_time_window_secs must be positive".into(),
            ));
        }
        check_unit("max_mm_probability", self.market_making.max_mm_probability)?;
        check_unit(
            "volatility_crush_probability",
            self.market_making.volatility_crush_probability,
        )?;
        check_unit("min_sample_confidence", self.min_sample_confidence)?;
        check_unit("min_confidence", self.min_confidence)?;
        if !self.min_volume.is_finite() || self.min_volume < 0.0 {
            return Err(FlowError::InvalidConfig("min_volume must be >= 0".into()));
        }
        Ok(())
    }
}

/// How the primary signal of a window is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Highest final confidence, earliest wins ties
    #[default]
    HighestConfidence,
    /// Most recently folded signal
    Latest,
}

impl FromStr for AggregationStrategy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "highest_confidence" | "highest-confidence" => Ok(AggregationStrategy::HighestConfidence),
            "latest" => Ok(AggregationStrategy::Latest),
            other => Err(FlowError::InvalidConfig(format!(
                "unknown aggregation strategy: {other}"
            ))),
        }
    }
}

/// Window aggregator configuration. The window width itself is fixed at five
/// minutes to line up with OHLCV bars.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregatorConfig {
    pub strategy: AggregationStrategy,
    /// Oldest pending signals are dropped past this many
    pub max_signals_per_window: usize,
    /// Signals below this only reach the raw buffer
    pub min_confidence: f64,
    /// Closed windows older than this (relative to the open window) are evicted
    pub retention_secs: i64,
    pub raw_buffer_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::HighestConfidence,
            max_signals_per_window: 50,
            min_confidence: 0.6,
            retention_secs: 4 * 60 * 60,
            raw_buffer_capacity: 1000,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            strategy: env_or("FLOW_AGGREGATION_STRATEGY", d.strategy),
            max_signals_per_window: env_or("FLOW_MAX_SIGNALS_PER_WINDOW", d.max_signals_per_window),
            min_confidence: env_or("FLOW_WINDOW_MIN_CONFIDENCE", d.min_confidence),
            retention_secs: env_or::<i64>("FLOW_RETENTION_HOURS", 4) * 60 * 60,
            raw_buffer_capacity: env_or("FLOW_RAW_BUFFER", d.raw_buffer_capacity),
        }
    }

    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_signals_per_window(mut self, max: usize) -> Self {
        self.max_signals_per_window = max;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention_secs = retention.num_seconds();
        self
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::seconds(self.retention_secs)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        check_nonzero("max_signals_per_window", self.max_signals_per_window)?;
        check_nonzero("raw_buffer_capacity", self.raw_buffer_capacity)?;
        check_unit("min_confidence", self.min_confidence)?;
        if self.retention_secs <= 0 {
            return Err(FlowError::InvalidConfig("retention must be positive".into()));
        }
        Ok(())
    }
}
