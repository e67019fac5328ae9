/// Barter Options Flow - institutional signal pipeline
///
/// Turns per-strike options order-flow pressure samples into institutional
/// activity signals and folds them into 5-minute windows:
/// - baseline: rolling N-day history and anomaly context per strike/kind
/// - pressure: real-time significance sub-scores
/// - market_making: dealer hedging (straddle) detection
/// - confidence: multi-factor scoring and strength classification
/// - engine / batch: per-sample and worker-pool orchestration
/// - window: thread-safe 5-minute window aggregation
pub mod baseline;
pub mod batch;
pub mod clock;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod error;
pub mod market_making;
pub mod pressure;
pub mod types;
pub mod window;

// Re-export commonly used types for convenience
pub use types::{
    ContractKey, DominantSide, InstitutionalSignal, OptionKind, PressureSample, SignalAction,
    SignalRisk, StrengthTier,
};

pub use baseline::{
    BaselineContext, BaselineStorage, BaselineStore, MemoryBaselineStorage, SqliteBaselineStorage,
};
pub use batch::BatchSignalEngine;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AggregationStrategy, AggregatorConfig, SignalConfig};
pub use engine::{EngineSummary, SignalEngine};
pub use error::FlowError;
pub use window::{AggregatedWindow, AggregatorStatistics, WindowAggregator, window_boundary};
