//! 5-minute signal windows aligned with OHLCV bar boundaries.
//!
//! Boundaries come from signal timestamps, never the wall clock, so replaying
//! the same signals always yields the same windows.

use crate::{
    clock::Clock,
    config::{AggregationStrategy, AggregatorConfig},
    types::{InstitutionalSignal, SignalAction, StrengthTier},
};
use chrono::{DateTime, TimeDelta, Utc};
use itertools::{Itertools, MinMaxResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Window width in seconds (5 minutes)
pub const WINDOW_SECS: i64 = 300;

/// Mean confidence change between halves of a window counted as flat
const TREND_TOLERANCE: f64 = 0.1;

/// Align a timestamp down to its 5-minute boundary.
#[inline]
pub fn window_boundary(time: DateTime<Utc>) -> DateTime<Utc> {
    let offset_secs = time.timestamp().rem_euclid(WINDOW_SECS);
    let offset = TimeDelta::seconds(offset_secs) + TimeDelta::nanoseconds(i64::from(time.timestamp_subsec_nanos()));
    time - offset
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceTrend {
    Increasing,
    Decreasing,
    Stable,
}

impl ConfidenceTrend {
    /// Mean confidence of the second half against the first.
    pub fn from_confidences(confidences: &[f64]) -> Self {
        if confidences.len() < 2 {
            return ConfidenceTrend::Stable;
        }

        let (first, second) = confidences.split_at(confidences.len() / 2);
        let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        let delta = mean(second) - mean(first);

        if delta > TREND_TOLERANCE {
            ConfidenceTrend::Increasing
        } else if delta < -TREND_TOLERANCE {
            ConfidenceTrend::Decreasing
        } else {
            ConfidenceTrend::Stable
        }
    }
}

/// Summary of the signals folded into one 5-minute window
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregatedWindow {
    pub boundary: DateTime<Utc>,
    pub primary_signal: InstitutionalSignal,
    pub signal_count: usize,
    pub min_confidence: f64,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub dominant_action: SignalAction,
    pub strength: StrengthTier,
    pub confidence_trend: ConfidenceTrend,
    pub first_signal_time: DateTime<Utc>,
    pub last_signal_time: DateTime<Utc>,
    pub duration_secs: i64,
}

impl AggregatedWindow {
    /// Fold `signals` (arrival order) into a window. `None` if there are none.
    pub fn from_signals(
        boundary: DateTime<Utc>,
        signals: &[InstitutionalSignal],
        strategy: AggregationStrategy,
    ) -> Option<Self> {
        let primary_signal = match strategy {
            AggregationStrategy::HighestConfidence => {
                signals.iter().reduce(|best, signal| {
                    if signal.final_confidence() > best.final_confidence() {
                        signal
                    } else {
                        best
                    }
                })
            }
            AggregationStrategy::Latest => signals.last(),
        }?
        .clone();

        let confidences: Vec<f64> = signals.iter().map(InstitutionalSignal::final_confidence).collect();
        let (min_confidence, max_confidence) = match confidences.iter().copied().minmax_by(f64::total_cmp) {
            MinMaxResult::NoElements => return None,
            MinMaxResult::OneElement(value) => (value, value),
            MinMaxResult::MinMax(min, max) => (min, max),
        };
        let avg_confidence = confidences.iter().sum::<f64>() / confidences.len() as f64;

        // Majority vote, earliest action wins ties
        let dominant_action = signals
            .iter()
            .map(|signal| signal.action)
            .unique()
            .map(|action| (action, signals.iter().filter(|s| s.action == action).count()))
            .fold(None, |best: Option<(SignalAction, usize)>, (action, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((action, count)),
            })
            .map(|(action, _)| action)?;

        let strength = signals.iter().map(|signal| signal.strength).max()?;

        let (first_signal_time, last_signal_time) =
            match signals.iter().map(|signal| signal.timestamp).minmax() {
                MinMaxResult::NoElements => return None,
                MinMaxResult::OneElement(time) => (time, time),
                MinMaxResult::MinMax(first, last) => (first, last),
            };

        Some(Self {
            boundary,
            primary_signal,
            signal_count: signals.len(),
            min_confidence,
            avg_confidence,
            max_confidence,
            dominant_action,
            strength,
            confidence_trend: ConfidenceTrend::from_confidences(&confidences),
            first_signal_time,
            last_signal_time,
            duration_secs: (last_signal_time - first_signal_time).num_seconds(),
        })
    }
}

/// Point-in-time counters for the aggregator
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AggregatorStatistics {
    pub signals_processed: u64,
    pub windows_created: u64,
    /// Signals pending in the open window
    pub current_open_count: usize,
    pub last_update_time: Option<DateTime<Utc>>,
    pub stored_windows: usize,
    pub raw_buffered: usize,
}

#[derive(Debug)]
struct OpenWindow {
    boundary: DateTime<Utc>,
    signals: VecDeque<InstitutionalSignal>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    open: Option<OpenWindow>,
    closed: BTreeMap<DateTime<Utc>, AggregatedWindow>,
    raw: VecDeque<InstitutionalSignal>,
    signals_processed: u64,
    windows_created: u64,
    last_update_time: Option<DateTime<Utc>>,
}

/// Thread-safe signal window aggregator.
///
/// One coarse lock guards all state; every call holds it for a bounded amount
/// of work. Share across producers and readers with an [`Arc`].
pub struct WindowAggregator {
    config: AggregatorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AggregatorState>,
}

impl std::fmt::Debug for WindowAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowAggregator")
            .field("config", &self.config)
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl WindowAggregator {
    pub fn new(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    /// Fold a signal into the open window. Returns the window closed by this
    /// signal, if its boundary is past the open one.
    ///
    /// Signals for an earlier boundary attach to the open window; closed windows
    /// are never reopened.
    pub fn add_signal(&self, signal: InstitutionalSignal) -> Option<AggregatedWindow> {
        let confidence = signal.final_confidence();
        if !confidence.is_finite() {
            warn!(strike = %signal.strike, kind = %signal.option_kind, "signal with non-finite confidence ignored");
            return None;
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        state.signals_processed += 1;
        state.last_update_time = Some(now);

        if state.raw.len() >= self.config.raw_buffer_capacity {
            state.raw.pop_front();
        }
        state.raw.push_back(signal.clone());

        if confidence < self.config.min_confidence {
            debug!(
                strike = %signal.strike,
                kind = %signal.option_kind,
                confidence,
                "signal below aggregation threshold"
            );
            return None;
        }

        let boundary = window_boundary(signal.timestamp);
        let closed = match state.open.as_mut() {
            Some(open) if boundary > open.boundary => {
                let next = OpenWindow {
                    boundary,
                    signals: VecDeque::from([signal]),
                };
                let previous = std::mem::replace(open, next);
                self.close(&mut state, previous)
            }
            Some(open) => {
                if boundary < open.boundary {
                    debug!(
                        %boundary,
                        open = %open.boundary,
                        "late signal attached to open window"
                    );
                }
                open.signals.push_back(signal);
                if open.signals.len() > self.config.max_signals_per_window {
                    open.signals.pop_front();
                }
                None
            }
            None => {
                state.open = Some(OpenWindow {
                    boundary,
                    signals: VecDeque::from([signal]),
                });
                None
            }
        };

        self.evict(&mut state);
        closed
    }

    /// Close the open window without waiting for a later signal.
    pub fn flush(&self) -> Option<AggregatedWindow> {
        let mut state = self.state.lock();
        let open = state.open.take()?;
        let closed = self.close(&mut state, open);
        self.evict(&mut state);
        closed
    }

    fn close(&self, state: &mut AggregatorState, window: OpenWindow) -> Option<AggregatedWindow> {
        let signals: Vec<InstitutionalSignal> = window.signals.into();
        let aggregated = AggregatedWindow::from_signals(window.boundary, &signals, self.config.strategy)?;

        info!(
            boundary = %aggregated.boundary,
            signals = aggregated.signal_count,
            avg_confidence = aggregated.avg_confidence,
            strength = %aggregated.strength,
            action = %aggregated.dominant_action,
            "signal window closed"
        );

        state.windows_created += 1;
        state.closed.insert(aggregated.boundary, aggregated.clone());
        Some(aggregated)
    }

    /// Drop closed windows older than the retention horizon, measured back from
    /// the newest boundary seen.
    fn evict(&self, state: &mut AggregatorState) {
        let newest = state
            .open
            .as_ref()
            .map(|open| open.boundary)
            .or_else(|| state.closed.last_key_value().map(|(boundary, _)| *boundary));

        let Some(newest) = newest else {
            return;
        };

        let cutoff = newest - self.config.retention();
        let retained = state.closed.split_off(&cutoff);
        let evicted = std::mem::replace(&mut state.closed, retained).len();
        if evicted > 0 {
            debug!(evicted, %cutoff, "evicted expired windows");
        }
    }

    /// Closed windows with boundaries in `[start, end]`, oldest first.
    pub fn signals_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<AggregatedWindow> {
        if start > end {
            return Vec::new();
        }

        self.state
            .lock()
            .closed
            .range(start..=end)
            .map(|(_, window)| window.clone())
            .collect()
    }

    /// Up to `n` most recent closed windows, oldest first.
    pub fn latest(&self, n: usize) -> Vec<AggregatedWindow> {
        let state = self.state.lock();
        let mut windows: Vec<AggregatedWindow> = state.closed.values().rev().take(n).cloned().collect();
        windows.reverse();
        windows
    }

    /// Partial stats of the still-open window, without closing it.
    pub fn current_window_preview(&self) -> Option<AggregatedWindow> {
        let state = self.state.lock();
        let open = state.open.as_ref()?;
        let signals: Vec<InstitutionalSignal> = open.signals.iter().cloned().collect();
        AggregatedWindow::from_signals(open.boundary, &signals, self.config.strategy)
    }

    /// Up to `n` most recent raw signals (including those below threshold), oldest first.
    pub fn raw_signals(&self, n: usize) -> Vec<InstitutionalSignal> {
        let state = self.state.lock();
        let start = state.raw.len().saturating_sub(n);
        state.raw.range(start..).cloned().collect()
    }

    pub fn statistics(&self) -> AggregatorStatistics {
        let state = self.state.lock();
        AggregatorStatistics {
            signals_processed: state.signals_processed,
            windows_created: state.windows_created,
            current_open_count: state.open.as_ref().map_or(0, |open| open.signals.len()),
            last_update_time: state.last_update_time,
            stored_windows: state.closed.len(),
            raw_buffered: state.raw.len(),
        }
    }
}
