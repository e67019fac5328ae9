use super::{BaselineContext, BaselineStats, BaselineStorage, HistoricalRow};
use crate::{
    clock::Clock,
    config::BaselineConfig,
    error::FlowError,
    types::{ContractKey, PressureSample},
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use fnv::FnvHashMap;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedBaseline {
    context: BaselineContext,
    cached_at: DateTime<Utc>,
}

/// Rolling N-day baseline manager.
///
/// Writes are buffered per (strike, kind, date) and flushed in batches; reads are
/// served from a TTL cache before falling back to precomputed statistics and
/// finally the raw history. Storage failures never escape: they degrade to
/// [`BaselineContext::neutral`] and set the [`is_degraded`](Self::is_degraded) flag.
pub struct BaselineStore<S> {
    storage: S,
    config: BaselineConfig,
    clock: Arc<dyn Clock>,
    cache: FnvHashMap<ContractKey, CachedBaseline>,
    pending: BTreeMap<(ContractKey, NaiveDate), HistoricalRow>,
    swept_at: DateTime<Utc>,
    degraded: bool,
}

impl<S> std::fmt::Debug for BaselineStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineStore")
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .field("pending", &self.pending.len())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl<S: BaselineStorage> BaselineStore<S> {
    pub fn new(storage: S, config: BaselineConfig, clock: Arc<dyn Clock>) -> Self {
        let swept_at = clock.now();
        Self {
            storage,
            config,
            clock,
            cache: FnvHashMap::default(),
            pending: BTreeMap::new(),
            swept_at,
            degraded: false,
        }
    }

    /// Buffer today's row for the sample's (strike, kind). A later sample on the
    /// same calendar day overwrites the earlier one.
    pub fn record(&mut self, sample: &PressureSample) {
        let row = HistoricalRow {
            key: sample.key(),
            date: sample.window_start.date_naive(),
            pressure_ratio: sample.pressure_ratio,
            volume: sample.total_volume(),
            confidence: sample.confidence,
        };
        self.pending.insert((row.key, row.date), row);

        if self.pending.len() >= self.config.write_batch_size {
            self.flush_logged();
        }
    }

    /// Write all pending rows in one storage batch. Returns the number written.
    ///
    /// Rows are dropped on failure so a broken store cannot grow the buffer unbounded.
    pub fn flush(&mut self) -> Result<usize, FlowError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let rows: Vec<HistoricalRow> = std::mem::take(&mut self.pending).into_values().collect();
        match self.storage.upsert_rows(&rows) {
            Ok(()) => {
                self.degraded = false;
                Ok(rows.len())
            }
            Err(error) => {
                self.degraded = true;
                Err(error)
            }
        }
    }

    fn flush_logged(&mut self) {
        if let Err(error) = self.flush() {
            warn!(%error, "failed to flush pressure history, rows dropped");
        }
    }

    /// Baseline for `key`, served from cache when younger than the TTL.
    ///
    /// Never fails: insufficient history or storage errors yield the neutral default.
    pub fn context(&mut self, key: &ContractKey) -> BaselineContext {
        let now = self.clock.now();

        if let Some(cached) = self.cache.get(key) {
            if now - cached.cached_at < self.config.cache_ttl() {
                return cached.context.clone();
            }
        }

        self.flush_logged();
        self.sweep_expired(now);

        match self.compute(key, now) {
            Ok(context) => {
                self.cache.insert(
                    *key,
                    CachedBaseline {
                        context: context.clone(),
                        cached_at: now,
                    },
                );
                context
            }
            Err(error) => {
                if error.is_degraded_baseline() {
                    self.degraded = true;
                }
                warn!(
                    strike = %key.strike,
                    kind = %key.kind,
                    %error,
                    "baseline unavailable, using neutral default"
                );
                BaselineContext::neutral(*key, self.config.lookback_days)
            }
        }
    }

    /// Drop expired cache entries, at most once per TTL, so keys that stopped
    /// trading do not stay cached for the life of the process.
    fn sweep_expired(&mut self, now: DateTime<Utc>) {
        let ttl = self.config.cache_ttl();
        if now - self.swept_at < ttl {
            return;
        }

        let before = self.cache.len();
        self.cache.retain(|_, cached| now - cached.cached_at < ttl);
        self.swept_at = now;
        debug!(evicted = before - self.cache.len(), "expired baselines swept");
    }

    /// Resolve baselines for many keys with a single flush of pending writes.
    pub fn contexts<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a ContractKey>,
    ) -> FnvHashMap<ContractKey, BaselineContext> {
        self.flush_logged();

        let mut resolved = FnvHashMap::default();
        for key in keys {
            if !resolved.contains_key(key) {
                let context = self.context(key);
                resolved.insert(*key, context);
            }
        }
        resolved
    }

    /// Statistics over the `lookback_days` calendar days before today. Today's row
    /// is excluded so a live sample is never judged against itself.
    fn compute(&mut self, key: &ContractKey, now: DateTime<Utc>) -> Result<BaselineContext, FlowError> {
        let lookback_days = self.config.lookback_days;
        let today = now.date_naive();

        if let Some(stats) = self.storage.load_stats(key, lookback_days)? {
            if stats.computed_at.date_naive() == today
                && now - stats.computed_at < self.config.cache_ttl()
                && stats.row_count >= self.config.min_history_rows
            {
                debug!(strike = %key.strike, kind = %key.kind, "baseline served from stats table");
                return Ok(BaselineContext::from_stats(&stats));
            }
        }

        let since = today - TimeDelta::days(i64::from(lookback_days));
        let mut rows = self.storage.rows_since(key, since)?;
        rows.retain(|row| row.date < today);

        if rows.len() < self.config.min_history_rows {
            debug!(
                strike = %key.strike,
                kind = %key.kind,
                rows = rows.len(),
                "insufficient history, using neutral baseline"
            );
            return Ok(BaselineContext::neutral(*key, lookback_days));
        }

        let stats = BaselineStats::from_rows(*key, lookback_days, &rows, now).ok_or_else(|| {
            FlowError::Analysis(format!("no baseline statistics for {key}"))
        })?;
        self.storage.upsert_stats(&stats)?;

        Ok(BaselineContext::from_stats(&stats))
    }

    /// Evaluate `ratio` against a context (z-score, percentile rank, anomaly flag).
    pub fn apply_current(ratio: f64, context: &BaselineContext) -> BaselineContext {
        context.apply_current(ratio)
    }

    /// True when the most recent storage operation failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}
