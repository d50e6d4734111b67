//! In-memory store backing orchestrator and trigger tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use error_stack::{Report, bail};
use futures::future::BoxFuture;

use crate::calculator::CalcValues;
use crate::engine::outcome::{AggregatedOutcome, RunSummary};
use crate::error::{DataError, StorageError};
use crate::model::{ChipRecord, Family, Observation, PriceBar, TimeSeries};
use crate::storage::{
    ResultReader, ResultSink, RunLog, SeriesSource, StockUniverse, TradingCalendar,
};

type ResultKey = (String, String, NaiveDate);

#[derive(Default)]
pub struct MemoryStore {
    prices: Mutex<HashMap<String, Vec<PriceBar>>>,
    chips: Mutex<HashMap<String, Vec<ChipRecord>>>,
    results: Mutex<BTreeMap<ResultKey, CalcValues>>,
    runs: Mutex<Vec<(Family, RunSummary)>>,
    fetch_delay: Mutex<Option<Duration>>,
    exists_delay: Mutex<Option<Duration>>,
    universe_delay: Mutex<Option<Duration>>,
    fail_persist: AtomicBool,
    fail_universe: AtomicBool,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bars(&self, stock_id: &str, bars: Vec<PriceBar>) {
        self.prices
            .lock()
            .unwrap()
            .insert(stock_id.to_string(), bars);
    }

    pub fn insert_chips(&self, stock_id: &str, records: Vec<ChipRecord>) {
        self.chips
            .lock()
            .unwrap()
            .insert(stock_id.to_string(), records);
    }

    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_universe(&self, fail: bool) {
        self.fail_universe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_exists_delay(&self, delay: Duration) {
        *self.exists_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_universe_delay(&self, delay: Duration) {
        *self.universe_delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stored(&self, stock_id: &str, calculator: &str, date: NaiveDate) -> Option<CalcValues> {
        let key = (stock_id.to_string(), calculator.to_string(), date);
        self.results.lock().unwrap().get(&key).cloned()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn runs(&self) -> Vec<(Family, RunSummary)> {
        self.runs.lock().unwrap().clone()
    }

    fn series<O: Observation>(
        &self,
        data: &Mutex<HashMap<String, Vec<O>>>,
        stock_id: String,
        as_of: NaiveDate,
        lookback: usize,
    ) -> BoxFuture<'_, Result<TimeSeries<O>, Report<DataError>>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        let observations: Vec<O> = data
            .lock()
            .unwrap()
            .get(&stock_id)
            .map(|all| {
                let upto: Vec<O> = all.iter().filter(|o| o.date() <= as_of).cloned().collect();
                let start = upto.len().saturating_sub(lookback);
                upto[start..].to_vec()
            })
            .unwrap_or_default();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if observations.is_empty() {
                bail!(DataError::Unavailable { stock_id });
            }
            TimeSeries::new(stock_id, observations)
        })
    }
}

impl StockUniverse for MemoryStore {
    fn list_known_stock_ids(
        &self,
    ) -> BoxFuture<'_, Result<BTreeSet<String>, Report<StorageError>>> {
        let delay = *self.universe_delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_universe.load(Ordering::SeqCst) {
                bail!(StorageError::Query);
            }
            let mut ids: BTreeSet<String> = self.prices.lock().unwrap().keys().cloned().collect();
            ids.extend(self.chips.lock().unwrap().keys().cloned());
            Ok(ids)
        })
    }
}

impl SeriesSource<PriceBar> for MemoryStore {
    fn get_series(
        &self,
        stock_id: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> BoxFuture<'_, Result<TimeSeries<PriceBar>, Report<DataError>>> {
        self.series(&self.prices, stock_id.to_string(), as_of, lookback)
    }
}

impl SeriesSource<ChipRecord> for MemoryStore {
    fn get_series(
        &self,
        stock_id: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> BoxFuture<'_, Result<TimeSeries<ChipRecord>, Report<DataError>>> {
        self.series(&self.chips, stock_id.to_string(), as_of, lookback)
    }
}

impl ResultSink for MemoryStore {
    fn persist(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
        values: &CalcValues,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let key = (stock_id.to_string(), calculator.to_string(), date);
        let values = values.clone();
        Box::pin(async move {
            if self.fail_persist.load(Ordering::SeqCst) {
                bail!(StorageError::Insert);
            }
            self.results.lock().unwrap().insert(key, values);
            Ok(())
        })
    }

    fn exists(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        let key = (stock_id.to_string(), calculator.to_string(), date);
        let delay = *self.exists_delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.results.lock().unwrap().contains_key(&key))
        })
    }
}

impl ResultReader for MemoryStore {
    fn get_result(
        &self,
        stock_id: &str,
        calculator: &str,
        date: NaiveDate,
    ) -> BoxFuture<'_, Result<Option<CalcValues>, Report<StorageError>>> {
        let key = (stock_id.to_string(), calculator.to_string(), date);
        Box::pin(async move { Ok(self.results.lock().unwrap().get(&key).cloned()) })
    }
}

impl TradingCalendar for MemoryStore {
    fn trading_dates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<NaiveDate>, Report<StorageError>>> {
        Box::pin(async move {
            let dates: BTreeSet<NaiveDate> = self
                .prices
                .lock()
                .unwrap()
                .values()
                .flatten()
                .map(|b| b.date)
                .filter(|d| (from..=to).contains(d))
                .collect();
            Ok(dates.into_iter().collect())
        })
    }
}

impl RunLog for MemoryStore {
    fn record_run(
        &self,
        outcome: &AggregatedOutcome,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let entry = (outcome.family, outcome.summary.clone());
        Box::pin(async move {
            self.runs.lock().unwrap().push(entry);
            Ok(())
        })
    }
}
