use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `barter-options-flow`.
///
/// None of these are fatal: the engine and aggregator boundaries degrade them to
/// "no signal" / "empty result" rather than propagating them to callers.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum FlowError {
    #[error("baseline storage failure: {0}")]
    Storage(String),

    #[error("malformed pressure sample: {0}")]
    MalformedSample(String),

    #[error("signal analysis failed: {0}")]
    Analysis(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FlowError {
    /// Determine if an error should be absorbed by substituting the neutral
    /// default baseline rather than suppressing the sample.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_degraded_baseline(&self) -> bool {
        match self {
            FlowError::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(format!("percentile encoding: {value}"))
    }
}
