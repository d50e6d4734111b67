use chrono::{NaiveDate, Utc};
use error_stack::{Report, ResultExt, bail};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use crate::calculator::CalcValues;
use crate::engine::outcome::AggregatedOutcome;
use crate::error::{DataError, StorageError};
use crate::model::{ChipRecord, PriceBar, TimeSeries};
use crate::storage::{
    ResultReader, ResultSink, RunLog, SeriesSource, StockUniverse, TradingCalendar,
};

type PriceRow = (NaiveDate, f64, f64, f64, f64, f64);

type ChipRow = (
    NaiveDate,
    f64,
    f64,
    f64,
    Option<f64>,
    Option<i64>,
    Option<f64>,
    Option<f64>,
);

/// A stored calculator result as listed by [`SqliteStorage::list_results`].
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub stock_id: String,
    pub calculator: String,
    pub date: NaiveDate,
    pub values: CalcValues,
}

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, Report<StorageError>> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;
        Ok(Self { pool })
    }

    /// Register stock ids so they join the default run universe.
    pub async fn upsert_stocks(
        &self,
        stock_ids: &BTreeSet<String>,
    ) -> Result<(), Report<StorageError>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StorageError::Insert)?;
        let now = Utc::now().to_rfc3339();
        for stock_id in stock_ids {
            sqlx::query("INSERT OR IGNORE INTO stocks (stock_id, created_at) VALUES (?, ?)")
                .bind(stock_id)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .change_context(StorageError::Insert)?;
        }
        tx.commit().await.change_context(StorageError::Insert)?;
        Ok(())
    }

    pub async fn upsert_price_bars(
        &self,
        stock_id: &str,
        bars: &[PriceBar],
    ) -> Result<(), Report<StorageError>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StorageError::Insert)?;

        for b in bars {
            sqlx::query(
                "INSERT OR REPLACE INTO daily_prices \
                 (stock_id, date, open, high, low, close, volume) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(stock_id)
            .bind(b.date)
            .bind(b.open)
            .bind(b.high)
            .bind(b.low)
            .bind(b.close)
            .bind(b.volume)
            .execute(&mut *tx)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("stock {stock_id} at {}", b.date))?;
        }

        tx.commit().await.change_context(StorageError::Insert)?;
        Ok(())
    }

    pub async fn upsert_chip_records(
        &self,
        stock_id: &str,
        records: &[ChipRecord],
    ) -> Result<(), Report<StorageError>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StorageError::Insert)?;

        for r in records {
            sqlx::query(
                "INSERT OR REPLACE INTO chip_records \
                 (stock_id, date, foreign_net, trust_net, dealer_net, \
                  major_holder_ratio, holder_count, margin_balance, short_balance) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(stock_id)
            .bind(r.date)
            .bind(r.foreign_net)
            .bind(r.trust_net)
            .bind(r.dealer_net)
            .bind(r.major_holder_ratio)
            .bind(r.holder_count)
            .bind(r.margin_balance)
            .bind(r.short_balance)
            .execute(&mut *tx)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("stock {stock_id} at {}", r.date))?;
        }

        tx.commit().await.change_context(StorageError::Insert)?;
        Ok(())
    }

    /// Price bars in `[from, to]`, oldest first.
    pub async fn price_bars_in_range(
        &self,
        stock_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>, Report<StorageError>> {
        let rows: Vec<PriceRow> = sqlx::query_as(
            "SELECT date, open, high, low, close, volume FROM daily_prices \
             WHERE stock_id = ? AND date >= ? AND date <= ? \
             ORDER BY date ASC",
        )
        .bind(stock_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .change_context(StorageError::Query)?;

        Ok(rows.into_iter().map(map_price_row).collect())
    }

    /// Stored results for `date`, optionally narrowed to one stock and
    /// calculator.
    pub async fn list_results(
        &self,
        date: NaiveDate,
        stock_id: Option<&str>,
        calculator: Option<&str>,
    ) -> Result<Vec<StoredResult>, Report<StorageError>> {
        let rows: Vec<(String, String, NaiveDate, String)> = sqlx::query_as(
            "SELECT stock_id, calculator, date, payload FROM metric_results \
             WHERE date = ?1 \
             AND (?2 IS NULL OR stock_id = ?2) \
             AND (?3 IS NULL OR calculator = ?3) \
             ORDER BY stock_id, calculator",
        )
        .bind(date)
        .bind(stock_id)
        .bind(calculator)
        .fetch_all(&self.pool)
        .await
        .change_context(StorageError::Query)?;

        rows.into_iter()
            .map(|(stock_id, calculator, date, payload)| {
                Ok(StoredResult {
                    values: decode_values(&payload)?,
                    stock_id,
                    calculator,
                    date,
                })
            })
            .collect()
    }
}

fn map_price_row((date, open, high, low, close, volume): PriceRow) -> PriceBar {
    PriceBar {
        date,
        open,
        high,
        low,
        close,
        volume,
    }
}

fn map_chip_row(
    (
        date,
        foreign_net,
        trust_net,
        dealer_net,
        major_holder_ratio,
        holder_count,
        margin_balance,
        short_balance,
    ): ChipRow,
) -> ChipRecord {
    ChipRecord {
        date,
        foreign_net,
        trust_net,
        dealer_net,
        major_holder_ratio,
        holder_count,
        margin_balance,
        short_balance,
    }
}

fn decode_values(payload: &str) -> Result<CalcValues, Report<StorageError>> {
    serde_json::from_str(payload)
        .change_context(StorageError::Decode {
            what: "metric result".into(),
        })
        .attach_with(|| format!("payload: {payload}"))
}

/// Rows come back newest first; the series wants oldest first.
fn trailing_series<O: crate::model::Observation>(
    stock_id: String,
    mut observations: Vec<O>,
) -> Result<TimeSeries<O>, Report<DataError>> {
    if observations.is_empty() {
        bail!(DataError::Unavailable { stock_id });
    }
    observations.reverse();
    TimeSeries::new(stock_id, observations)
}

impl StockUniverse for SqliteStorage {
    fn list_known_stock_ids(
        &self,
    ) -> BoxFuture<'_, Result<BTreeSet<String>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as("SELECT stock_id FROM stocks")
                .fetch_all(&self.pool)
                .await
                .change_context(StorageError::Query)?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
    }
}

impl SeriesSource<PriceBar> for SqliteStorage {
    fn get_series(
        &self,
        stock_id: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> BoxFuture<'_, Result<TimeSeries<PriceBar>, Report<DataError>>> {
        let stock_id = stock_id.to_string();
        Box::pin(async move {
            let rows: Vec<PriceRow> = sqlx::query_as(
                "SELECT date, open, high, low, close, volume FROM daily_prices \
                 WHERE stock_id = ? AND date <= ? \
                 ORDER BY date DESC \
                 LIMIT ?",
            )
            .bind(&stock_id)
            .bind(as_of)
            .bind(lookback as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(DataError::Query)
            .attach_with(|| format!("stock {stock_id}"))?;

            trailing_series(stock_id, rows.into_iter().map(map_price_row).collect())
        })
    }
}

impl SeriesSource<ChipRecord> for SqliteStorage {
    fn get_series(
        &self,
        stock_id: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> BoxFuture<'_, Result<TimeSeries<ChipRecord>, Report<DataError>>> {
        let stock_id = stock_id.to_string();
        Box::pin(async move {
            let rows: Vec<ChipRow> = sqlx::query_as(
                "SELECT date, foreign_net, trust_net, dealer_net, \
                 major_holder_ratio, holder_count, margin_balance, short_balance \
                 FROM chip_records \
                 WHERE stock_id = ? AND date <= ? \
                 ORDER BY date DESC \
                 LIMIT ?",
            )
            .bind(&stock_id)
            .bind(as_of)
            .bind(lookback as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(DataError::Query)
            .attach_with(|| format!("stock {stock_id}"))?;

            trailing_series(stock_id, rows.into_iter().map(map_chip_row).collect())
        })
    }
}

impl ResultSink for SqliteStorage {
    fn persist(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
        values: &CalcValues,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let stock_id = stock_id.to_string();
        let calculator = calculator.to_string();
        let payload = serde_json::to_string(values);
        Box::pin(async move {
            let payload = payload.change_context(StorageError::Insert)?;
            sqlx::query(
                "INSERT OR REPLACE INTO metric_results \
                 (stock_id, calculator, date, payload, computed_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&stock_id)
            .bind(&calculator)
            .bind(date)
            .bind(&payload)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn exists(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        let stock_id = stock_id.to_string();
        let calculator = calculator.to_string();
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM metric_results \
                 WHERE stock_id = ? AND calculator = ? AND date = ? \
                 LIMIT 1",
            )
            .bind(&stock_id)
            .bind(&calculator)
            .bind(date)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;
            Ok(row.is_some())
        })
    }
}

impl ResultReader for SqliteStorage {
    fn get_result(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
    ) -> BoxFuture<'_, Result<Option<CalcValues>, Report<StorageError>>> {
        let stock_id = stock_id.to_string();
        let calculator = calculator.to_string();
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT payload FROM metric_results \
                 WHERE stock_id = ? AND calculator = ? AND date = ? \
                 LIMIT 1",
            )
            .bind(&stock_id)
            .bind(&calculator)
            .bind(date)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            row.map(|(payload,)| decode_values(&payload)).transpose()
        })
    }
}

impl TradingCalendar for SqliteStorage {
    fn trading_dates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<NaiveDate>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(NaiveDate,)> = sqlx::query_as(
                "SELECT DISTINCT date FROM daily_prices \
                 WHERE date >= ? AND date <= ? \
                 ORDER BY date ASC",
            )
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;
            Ok(rows.into_iter().map(|(d,)| d).collect())
        })
    }
}

impl RunLog for SqliteStorage {
    fn record_run(
        &self,
        outcome: &AggregatedOutcome,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let run_id = outcome.run_id.to_string();
        let family = outcome.family.to_string();
        let date = outcome.date;
        let summary = outcome.summary.clone();
        let cancelled = outcome.cancelled;
        Box::pin(async move {
            let causes = serde_json::to_string(&summary.failure_causes)
                .change_context(StorageError::Insert)?;
            sqlx::query(
                "INSERT INTO calculation_runs \
                 (run_id, family, date, succeeded, already_computed, skipped, failed, \
                  unpersisted, failure_causes, cancelled, finished_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&run_id)
            .bind(&family)
            .bind(date)
            .bind(summary.succeeded as i64)
            .bind(summary.already_computed as i64)
            .bind(summary.skipped as i64)
            .bind(summary.failed as i64)
            .bind(summary.unpersisted as i64)
            .bind(&causes)
            .bind(cancelled)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }
}
