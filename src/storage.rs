#[cfg(test)]
pub mod memory;
pub mod sqlite;

use std::collections::BTreeSet;

use chrono::NaiveDate;
use error_stack::Report;
use futures::future::BoxFuture;

use crate::calculator::CalcValues;
use crate::engine::outcome::AggregatedOutcome;
use crate::error::{DataError, StorageError};
use crate::model::{Observation, TimeSeries};

/// The set of stocks a run covers when a plan names none.
pub trait StockUniverse: Send + Sync {
    fn list_known_stock_ids(&self) -> BoxFuture<'_, Result<BTreeSet<String>, Report<StorageError>>>;
}

/// Source of per-stock series for one observation type.
pub trait SeriesSource<O: Observation>: Send + Sync {
    /// The trailing `lookback` observations dated on or before `as_of`,
    /// oldest first.
    ///
    /// Fails with [`DataError::Unavailable`] when the stock has no
    /// observations at all up to `as_of`.
    fn get_series(
        &self,
        stock_id: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> BoxFuture<'_, Result<TimeSeries<O>, Report<DataError>>>;
}

/// Persistence boundary for calculator results.
pub trait ResultSink: Send + Sync {
    /// Insert or replace the result for `(stock_id, calculator, date)`.
    fn persist(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
        values: &CalcValues,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn exists(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>>;
}

/// Query side of stored results.
pub trait ResultReader: Send + Sync {
    fn get_result(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
    ) -> BoxFuture<'_, Result<Option<CalcValues>, Report<StorageError>>>;
}

pub trait TradingCalendar: Send + Sync {
    /// Dates with at least one price observation in `[from, to]`, ascending.
    fn trading_dates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<NaiveDate>, Report<StorageError>>>;
}

/// Audit log of finished runs.
pub trait RunLog: Send + Sync {
    fn record_run(
        &self,
        outcome: &AggregatedOutcome,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;
}
