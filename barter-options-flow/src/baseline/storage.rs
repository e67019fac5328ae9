//! Durable baseline persistence.
//!
//! Two logical tables keyed in (strike, option kind) order:
//! - `pressure_history` - one row per (strike, kind, date), upserted
//! - `baseline_stats` - optional precomputed statistics per (strike, kind, lookback)

use super::{BaselineStats, HistoricalRow};
use crate::{error::FlowError, types::ContractKey};
use chrono::{DateTime, NaiveDate};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use std::{collections::BTreeMap, path::Path};
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Key-ordered store for historical pressure rows and cached statistics.
pub trait BaselineStorage: Send {
    /// Insert or overwrite rows by (strike, kind, date).
    fn upsert_rows(&mut self, rows: &[HistoricalRow]) -> Result<(), FlowError>;

    /// Rows for `key` dated on or after `since`, ascending by date.
    fn rows_since(&self, key: &ContractKey, since: NaiveDate) -> Result<Vec<HistoricalRow>, FlowError>;

    fn upsert_stats(&mut self, stats: &BaselineStats) -> Result<(), FlowError>;

    fn load_stats(
        &self,
        key: &ContractKey,
        lookback_days: u32,
    ) -> Result<Option<BaselineStats>, FlowError>;

    fn backend_type(&self) -> &'static str;
}

impl<T: BaselineStorage + ?Sized> BaselineStorage for Box<T> {
    fn upsert_rows(&mut self, rows: &[HistoricalRow]) -> Result<(), FlowError> {
        (**self).upsert_rows(rows)
    }

    fn rows_since(&self, key: &ContractKey, since: NaiveDate) -> Result<Vec<HistoricalRow>, FlowError> {
        (**self).rows_since(key, since)
    }

    fn upsert_stats(&mut self, stats: &BaselineStats) -> Result<(), FlowError> {
        (**self).upsert_stats(stats)
    }

    fn load_stats(
        &self,
        key: &ContractKey,
        lookback_days: u32,
    ) -> Result<Option<BaselineStats>, FlowError> {
        (**self).load_stats(key, lookback_days)
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// In-process storage used when no database is configured, and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryBaselineStorage {
    rows: BTreeMap<(ContractKey, NaiveDate), HistoricalRow>,
    stats: BTreeMap<(ContractKey, u32), BaselineStats>,
}

impl MemoryBaselineStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BaselineStorage for MemoryBaselineStorage {
    fn upsert_rows(&mut self, rows: &[HistoricalRow]) -> Result<(), FlowError> {
        for row in rows {
            self.rows.insert((row.key, row.date), row.clone());
        }
        Ok(())
    }

    fn rows_since(&self, key: &ContractKey, since: NaiveDate) -> Result<Vec<HistoricalRow>, FlowError> {
        Ok(self
            .rows
            .range((*key, since)..=(*key, NaiveDate::MAX))
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn upsert_stats(&mut self, stats: &BaselineStats) -> Result<(), FlowError> {
        self.stats
            .insert((stats.key, stats.lookback_days), stats.clone());
        Ok(())
    }

    fn load_stats(
        &self,
        key: &ContractKey,
        lookback_days: u32,
    ) -> Result<Option<BaselineStats>, FlowError> {
        Ok(self.stats.get(&(*key, lookback_days)).cloned())
    }

    fn backend_type(&self) -> &'static str {
        "Memory"
    }
}

/// SQLite-backed storage (WAL journal, one transaction per batch).
pub struct SqliteBaselineStorage {
    conn: Connection,
}

impl std::fmt::Debug for SqliteBaselineStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBaselineStorage")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteBaselineStorage {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, FlowError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    FlowError::Storage(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "SQLite journal mode set");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, FlowError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, FlowError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pressure_history (
                strike TEXT NOT NULL,
                option_kind TEXT NOT NULL,
                date TEXT NOT NULL,
                pressure_ratio REAL NOT NULL,
                volume REAL NOT NULL,
                confidence REAL NOT NULL,
                PRIMARY KEY (strike, option_kind, date)
            );
            CREATE TABLE IF NOT EXISTS baseline_stats (
                strike TEXT NOT NULL,
                option_kind TEXT NOT NULL,
                lookback_days INTEGER NOT NULL,
                mean REAL NOT NULL,
                std_dev REAL NOT NULL,
                percentiles TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                avg_confidence REAL NOT NULL,
                computed_at INTEGER NOT NULL,
                PRIMARY KEY (strike, option_kind, lookback_days)
            );",
        )?;

        info!("baseline storage initialised (SQLite)");
        Ok(Self { conn })
    }
}

fn strike_text(strike: &Decimal) -> String {
    strike.normalize().to_string()
}

fn decode_row(
    key: &ContractKey,
    date: String,
    pressure_ratio: f64,
    volume: f64,
    confidence: f64,
) -> Result<HistoricalRow, FlowError> {
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| FlowError::Storage(format!("invalid stored date {date}: {e}")))?;
    Ok(HistoricalRow {
        key: *key,
        date,
        pressure_ratio,
        volume,
        confidence,
    })
}

impl BaselineStorage for SqliteBaselineStorage {
    fn upsert_rows(&mut self, rows: &[HistoricalRow]) -> Result<(), FlowError> {
        if rows.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO pressure_history
                    (strike, option_kind, date, pressure_ratio, volume, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(strike, option_kind, date) DO UPDATE SET
                    pressure_ratio = excluded.pressure_ratio,
                    volume = excluded.volume,
                    confidence = excluded.confidence",
            )?;
            for row in rows {
                stmt.execute(params![
                    strike_text(&row.key.strike),
                    row.key.kind.as_str(),
                    row.date.format(DATE_FORMAT).to_string(),
                    row.pressure_ratio,
                    row.volume,
                    row.confidence,
                ])?;
            }
        }
        tx.commit()?;

        debug!(rows = rows.len(), "flushed pressure history to SQLite");
        Ok(())
    }

    fn rows_since(&self, key: &ContractKey, since: NaiveDate) -> Result<Vec<HistoricalRow>, FlowError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT date, pressure_ratio, volume, confidence
             FROM pressure_history
             WHERE strike = ?1 AND option_kind = ?2 AND date >= ?3
             ORDER BY date ASC",
        )?;

        let raw = stmt
            .query_map(
                params![
                    strike_text(&key.strike),
                    key.kind.as_str(),
                    since.format(DATE_FORMAT).to_string(),
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(date, ratio, volume, confidence)| decode_row(key, date, ratio, volume, confidence))
            .collect()
    }

    fn upsert_stats(&mut self, stats: &BaselineStats) -> Result<(), FlowError> {
        let percentiles = serde_json::to_string(&stats.percentiles)?;
        self.conn.execute(
            "INSERT INTO baseline_stats
                (strike, option_kind, lookback_days, mean, std_dev, percentiles,
                 row_count, avg_confidence, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(strike, option_kind, lookback_days) DO UPDATE SET
                mean = excluded.mean,
                std_dev = excluded.std_dev,
                percentiles = excluded.percentiles,
                row_count = excluded.row_count,
                avg_confidence = excluded.avg_confidence,
                computed_at = excluded.computed_at",
            params![
                strike_text(&stats.key.strike),
                stats.key.kind.as_str(),
                stats.lookback_days,
                stats.mean,
                stats.std_dev,
                percentiles,
                stats.row_count as i64,
                stats.avg_confidence,
                stats.computed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn load_stats(
        &self,
        key: &ContractKey,
        lookback_days: u32,
    ) -> Result<Option<BaselineStats>, FlowError> {
        let raw = self
            .conn
            .query_row(
                "SELECT mean, std_dev, percentiles, row_count, avg_confidence, computed_at
                 FROM baseline_stats
                 WHERE strike = ?1 AND option_kind = ?2 AND lookback_days = ?3",
                params![strike_text(&key.strike), key.kind.as_str(), lookback_days],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((mean, std_dev, percentiles, row_count, avg_confidence, computed_at)) = raw else {
            return Ok(None);
        };

        let computed_at = DateTime::from_timestamp_millis(computed_at)
            .ok_or_else(|| FlowError::Storage(format!("invalid computed_at {computed_at}")))?;

        Ok(Some(BaselineStats {
            key: *key,
            lookback_days,
            mean,
            std_dev,
            percentiles: serde_json::from_str(&percentiles)?,
            row_count: row_count.max(0) as usize,
            avg_confidence,
            computed_at,
        }))
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionKind;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn row(key: ContractKey, day: u32, ratio: f64) -> HistoricalRow {
        HistoricalRow {
            key,
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            pressure_ratio: ratio,
            volume: 1_000.0,
            confidence: 0.9,
        }
    }

    fn exercise_storage(storage: &mut dyn BaselineStorage) {
        let call = ContractKey::new(dec!(450.0), OptionKind::Call);
        let put = ContractKey::new(dec!(450), OptionKind::Put);

        storage
            .upsert_rows(&[row(call, 1, 1.0), row(call, 2, 2.0), row(call, 3, 3.0), row(put, 2, 9.0)])
            .unwrap();
        // Same day overwrites
        storage.upsert_rows(&[row(call, 2, 2.5)]).unwrap();

        let since = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let rows = storage.rows_since(&call, since).unwrap();
        let ratios: Vec<f64> = rows.iter().map(|r| r.pressure_ratio).collect();
        assert_eq!(ratios, vec![2.5, 3.0]);

        let put_rows = storage
            .rows_since(&put, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .unwrap();
        assert_eq!(put_rows.len(), 1);

        assert!(storage.load_stats(&call, 20).unwrap().is_none());

        let stats = BaselineStats {
            key: call,
            lookback_days: 20,
            mean: 2.0,
            std_dev: 0.5,
            percentiles: BTreeMap::from([(50, 2.0), (95, 3.0)]),
            row_count: 3,
            avg_confidence: 0.9,
            computed_at: Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap(),
        };
        storage.upsert_stats(&stats).unwrap();
        assert_eq!(storage.load_stats(&call, 20).unwrap(), Some(stats));
        assert!(storage.load_stats(&call, 10).unwrap().is_none());
    }

    #[test]
    fn test_memory_storage() {
        exercise_storage(&mut MemoryBaselineStorage::new());
    }

    #[test]
    fn test_sqlite_storage_in_memory() {
        exercise_storage(&mut SqliteBaselineStorage::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_storage_persists_to_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("baselines").join("flow.db");
        let key = ContractKey::new(dec!(455), OptionKind::Call);

        {
            let mut storage = SqliteBaselineStorage::open(&db_path).unwrap();
            storage.upsert_rows(&[row(key, 5, 1.7)]).unwrap();
            assert_eq!(storage.backend_type(), "SQLite");
        }

        let storage = SqliteBaselineStorage::open(&db_path).unwrap();
        let rows = storage
            .rows_since(&key, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pressure_ratio, 1.7);
    }
}
