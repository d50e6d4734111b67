pub mod detection;
pub mod outcome;
pub mod plan;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use futures::{StreamExt, future, stream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DataError, EngineError};
use crate::model::{Family, Observation, TimeSeries};
use crate::registry::{Registered, Registry};
use crate::storage::{ResultSink, RunLog, SeriesSource, StockUniverse};
use outcome::{
    AggregatedOutcome, FailureCause, FailureKind, PairOutcome, SkipReason, StockOutcomes,
};
use plan::CalculationPlan;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Stocks processed at once.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub persist_timeout: Duration,
    /// Extra observations fetched beyond the largest calculator window.
    pub lookback_padding: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            fetch_timeout: Duration::from_secs(10),
            persist_timeout: Duration::from_secs(10),
            lookback_padding: 5,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            persist_timeout: Duration::from_secs(config.persist_timeout_secs),
            lookback_padding: config.lookback_padding,
        }
    }
}

/// Runs every selected calculator of one family over a set of stocks for
/// one date.
///
/// Failures are isolated per (stock, calculator) pair: a pair that cannot be
/// computed is recorded in the outcome and never aborts the rest of the run.
pub struct Orchestrator<O: Observation> {
    registry: Arc<Registry<O>>,
    universe: Arc<dyn StockUniverse>,
    source: Arc<dyn SeriesSource<O>>,
    sink: Arc<dyn ResultSink>,
    run_log: Option<Arc<dyn RunLog>>,
    settings: EngineSettings,
}

impl<O: Observation> Orchestrator<O> {
    pub fn new(
        registry: Arc<Registry<O>>,
        universe: Arc<dyn StockUniverse>,
        source: Arc<dyn SeriesSource<O>>,
        sink: Arc<dyn ResultSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            universe,
            source,
            sink,
            run_log: None,
            settings,
        }
    }

    /// Record each finished run's summary.
    pub fn with_run_log(mut self, run_log: Arc<dyn RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn registry(&self) -> &Registry<O> {
        &self.registry
    }

    pub async fn run(
        &self,
        plan: &CalculationPlan,
        cancel: &CancellationToken,
    ) -> Result<AggregatedOutcome, Report<EngineError>> {
        let run_id = Uuid::new_v4();
        let family = self.registry.family();

        let stocks: BTreeSet<String> = match plan.explicit_stocks() {
            Some(stocks) => stocks.clone(),
            None => self.resolve_universe(family).await?,
        };
        let calculators = self.registry.select(
            plan.priority,
            plan.calculators.as_ref(),
            plan.categories.as_ref(),
        );

        info!(
            %run_id,
            %family,
            date = %plan.date,
            priority = %plan.priority,
            force = plan.force_recalculate,
            stocks = stocks.len(),
            calculators = calculators.len(),
            "starting calculation run"
        );
        if calculators.is_empty() {
            warn!(%run_id, %family, "no calculators selected by plan");
        }

        let calculators = calculators.as_slice();
        let results: Vec<(String, StockOutcomes)> = stream::iter(stocks)
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|stock_id| async move {
                let outcomes = self.run_stock(&stock_id, plan, calculators, cancel).await;
                (stock_id, outcomes)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let cancelled = cancel.is_cancelled();
        let stocks = results
            .into_iter()
            .filter(|(_, outcomes)| !outcomes.is_empty())
            .collect();
        let outcome = AggregatedOutcome::from_stocks(run_id, family, plan.date, stocks, cancelled);

        info!(
            %run_id,
            %family,
            date = %plan.date,
            cancelled,
            succeeded = outcome.summary.succeeded,
            already_computed = outcome.summary.already_computed,
            skipped = outcome.summary.skipped,
            failed = outcome.summary.failed,
            unpersisted = outcome.summary.unpersisted,
            "calculation run finished"
        );

        if let Some(run_log) = &self.run_log {
            match timeout(self.settings.persist_timeout, run_log.record_run(&outcome)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = ?e, %run_id, "failed to record run summary"),
                Err(_) => warn!(%run_id, "recording run summary timed out"),
            }
        }

        Ok(outcome)
    }

    async fn resolve_universe(
        &self,
        family: Family,
    ) -> Result<BTreeSet<String>, Report<EngineError>> {
        match timeout(self.settings.persist_timeout, self.universe.list_known_stock_ids()).await {
            Ok(listed) => listed
                .change_context(EngineError::Universe)
                .attach_with(|| format!("family: {family}")),
            Err(_) => Err(Report::new(EngineError::Universe).attach(format!(
                "family: {family}, lookup exceeded {:?}",
                self.settings.persist_timeout
            ))),
        }
    }

    /// Whether a result is already stored. A failed or timed out check
    /// counts as not computed.
    async fn already_computed(&self, stock_id: &str, calculator: &str, date: NaiveDate) -> bool {
        let checked = timeout(
            self.settings.persist_timeout,
            self.sink.exists(stock_id, calculator, date),
        )
        .await;
        match checked {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                warn!(error = ?e, stock_id, calculator, "existence check failed, recomputing");
                false
            }
            Err(_) => {
                warn!(stock_id, calculator, "existence check timed out, recomputing");
                false
            }
        }
    }

    async fn run_stock(
        &self,
        stock_id: &str,
        plan: &CalculationPlan,
        calculators: &[Registered<O>],
        cancel: &CancellationToken,
    ) -> StockOutcomes {
        let mut outcomes = StockOutcomes::new();
        let mut pending = Vec::with_capacity(calculators.len());

        for entry in calculators {
            if cancel.is_cancelled() {
                break;
            }
            let name = entry.calculator.name();
            if !plan.force_recalculate && self.already_computed(stock_id, name, plan.date).await {
                debug!(stock_id, calculator = name, "already computed");
                outcomes.insert(name.to_string(), PairOutcome::AlreadyComputed);
                continue;
            }
            pending.push(entry);
        }

        if pending.is_empty() {
            return outcomes;
        }

        let lookback = pending
            .iter()
            .map(|e| required(e))
            .max()
            .unwrap_or(0)
            + self.settings.lookback_padding;

        let fetched = timeout(
            self.settings.fetch_timeout,
            self.source.get_series(stock_id, plan.date, lookback),
        )
        .await;
        let series = match fetched {
            Ok(Ok(series)) => series,
            Ok(Err(report)) => {
                let cause = fetch_failure(&report);
                warn!(error = ?report, stock_id, pending = pending.len(), "series fetch failed");
                fail_all(&mut outcomes, &pending, &cause);
                return outcomes;
            }
            Err(_) => {
                let cause = FailureCause::new(
                    FailureKind::Timeout,
                    format!("series fetch exceeded {:?}", self.settings.fetch_timeout),
                );
                warn!(stock_id, pending = pending.len(), "series fetch timed out");
                fail_all(&mut outcomes, &pending, &cause);
                return outcomes;
            }
        };

        for entry in pending {
            if cancel.is_cancelled() {
                debug!(stock_id, "run cancelled, not starting remaining calculators");
                break;
            }
            let name = entry.calculator.name();
            let outcome = self.execute_pair(plan.date, entry, &series).await;
            let label = outcome.label();
            match outcome.failure() {
                Some(cause) => {
                    warn!(stock_id, calculator = name, outcome = label, %cause, "pair failed")
                }
                None => debug!(stock_id, calculator = name, outcome = label, "pair finished"),
            }
            outcomes.insert(name.to_string(), outcome);
        }

        outcomes
    }

    /// Evaluate one calculator against an already fetched series.
    async fn execute_pair(
        &self,
        date: NaiveDate,
        entry: &Registered<O>,
        series: &TimeSeries<O>,
    ) -> PairOutcome {
        let calculator = entry.calculator.as_ref();
        let min = calculator.metadata().min_data_points;

        if series.len() < min || !calculator.has_enough_data(series, &entry.params) {
            return PairOutcome::Skipped(SkipReason::InsufficientData {
                required: required(entry),
                available: series.len(),
            });
        }

        let values = match calculator.calculate(series, &entry.params) {
            Ok(values) => values,
            Err(report) => {
                return PairOutcome::failed(
                    FailureKind::Calculation,
                    report.current_context().to_string(),
                );
            }
        };
        if let Some((key, _)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return PairOutcome::failed(
                FailureKind::Calculation,
                format!("non-finite output \"{key}\""),
            );
        }

        let persisted = timeout(
            self.settings.persist_timeout,
            self.sink
                .persist(series.stock_id(), calculator.name(), date, &values),
        )
        .await;
        match persisted {
            Ok(Ok(())) => PairOutcome::Computed { values },
            Ok(Err(report)) => PairOutcome::Unpersisted {
                values,
                cause: FailureCause::new(FailureKind::Sink, report.current_context().to_string()),
            },
            Err(_) => PairOutcome::Unpersisted {
                values,
                cause: FailureCause::new(
                    FailureKind::Timeout,
                    format!("persist exceeded {:?}", self.settings.persist_timeout),
                ),
            },
        }
    }
}

/// Observations a calculator needs under its effective params.
fn required<O: Observation>(entry: &Registered<O>) -> usize {
    let calculator = entry.calculator.as_ref();
    calculator
        .required_points(&entry.params)
        .max(calculator.metadata().min_data_points)
}

fn fail_all<O: Observation>(
    outcomes: &mut StockOutcomes,
    pending: &[&Registered<O>],
    cause: &FailureCause,
) {
    for entry in pending {
        outcomes.insert(
            entry.calculator.name().to_string(),
            PairOutcome::Failed(cause.clone()),
        );
    }
}

fn fetch_failure(report: &Report<DataError>) -> FailureCause {
    let kind = match report.current_context() {
        DataError::Unavailable { .. } => FailureKind::DataUnavailable,
        DataError::Malformed { .. } => FailureKind::MalformedSeries,
        DataError::Query => FailureKind::Source,
    };
    FailureCause::new(kind, report.current_context().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::calculator::{
        CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
    };
    use crate::error::CalculationError;
    use crate::indicator::ma::{Ema, Sma};
    use crate::indicator::rsi::Rsi;
    use crate::indicator::bollinger::BollingerBands;
    use crate::model::fixtures::{bars_ending, date};
    use crate::model::{Category, Family, PriceBar, PriorityTier};
    use crate::registry::Overrides;
    use crate::storage::memory::MemoryStore;
    use plan::PriorityFilter;

    /// Returns the latest close and counts invocations.
    struct Counting {
        metadata: CalculatorMetadata,
        calls: AtomicUsize,
    }

    impl Counting {
        fn new(name: &str, min: usize) -> Arc<Self> {
            Arc::new(Self {
                metadata: CalculatorMetadata::new(name, Category::Trend, min, PriorityTier::P0),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Calculator<PriceBar> for Counting {
        fn metadata(&self) -> &CalculatorMetadata {
            &self.metadata
        }

        fn calculate(
            &self,
            series: &TimeSeries<PriceBar>,
            _params: &CalcParams,
        ) -> Result<CalcValues, Report<CalculationError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let last = series.last().map(|b| b.close).unwrap_or_default();
            Ok(values([("last", CalcValue::Number(last))]))
        }
    }

    /// Rejects every series it is given.
    struct AlwaysFails(CalculatorMetadata);

    impl Calculator<PriceBar> for AlwaysFails {
        fn metadata(&self) -> &CalculatorMetadata {
            &self.0
        }

        fn calculate(
            &self,
            _series: &TimeSeries<PriceBar>,
            _params: &CalcParams,
        ) -> Result<CalcValues, Report<CalculationError>> {
            Err(Report::new(CalculationError::InvalidInput {
                reason: "always fails".into(),
            }))
        }
    }

    struct NotANumber(CalculatorMetadata);

    impl Calculator<PriceBar> for NotANumber {
        fn metadata(&self) -> &CalculatorMetadata {
            &self.0
        }

        fn calculate(
            &self,
            _series: &TimeSeries<PriceBar>,
            _params: &CalcParams,
        ) -> Result<CalcValues, Report<CalculationError>> {
            Ok(values([("value", CalcValue::Number(f64::NAN))]))
        }
    }

    fn registry(calculators: Vec<Arc<dyn Calculator<PriceBar>>>) -> Arc<Registry<PriceBar>> {
        Arc::new(Registry::new(Family::Technical, calculators, &Overrides::new()).unwrap())
    }

    fn orchestrator(
        registry: Arc<Registry<PriceBar>>,
        store: &Arc<MemoryStore>,
        settings: EngineSettings,
    ) -> Orchestrator<PriceBar> {
        Orchestrator::new(registry, store.clone(), store.clone(), store.clone(), settings)
            .with_run_log(store.clone())
    }

    fn run_date() -> NaiveDate {
        date("2025-01-02")
    }

    fn rising(n: usize) -> Vec<PriceBar> {
        let closes: Vec<f64> = (1..=n).map(|i| i as f64).collect();
        bars_ending(run_date(), &closes)
    }

    fn wave(n: usize) -> Vec<PriceBar> {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + (i as f64 / 3.0).sin() * 8.0).collect();
        bars_ending(run_date(), &closes)
    }

    #[tokio::test]
    async fn computes_moving_average_for_single_stock() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        let engine = orchestrator(
            registry(vec![Arc::new(Sma::new(20, PriorityTier::P0))]),
            &store,
            EngineSettings::default(),
        );

        let plan = CalculationPlan::for_date(run_date()).with_stocks(["2330"]);
        let outcome = engine.run(&plan, &CancellationToken::new()).await.unwrap();

        // mean of 11..=30
        let expected = 20.5;
        match outcome.get("2330", "sma_20").unwrap() {
            PairOutcome::Computed { values } => {
                assert_eq!(values["value"].as_number(), Some(expected));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(outcome.summary.succeeded, 1);
        assert!(!outcome.cancelled);

        let stored = store.stored("2330", "sma_20", run_date()).unwrap();
        assert_eq!(stored["value"].as_number(), Some(expected));
        assert_eq!(store.runs().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_data_skips_without_calling() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("1234", rising(5));
        let counting = Counting::new("needs_20", 20);
        let engine = orchestrator(
            registry(vec![counting.clone()]),
            &store,
            EngineSettings::default(),
        );

        let plan = CalculationPlan::for_date(run_date()).with_stocks(["1234"]);
        let outcome = engine.run(&plan, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.get("1234", "needs_20"),
            Some(&PairOutcome::Skipped(SkipReason::InsufficientData {
                required: 20,
                available: 5,
            }))
        );
        assert_eq!(counting.calls(), 0);
        assert_eq!(outcome.summary.skipped, 1);
        assert_eq!(store.result_count(), 0);
    }

    #[tokio::test]
    async fn rerun_is_idempotent_unless_forced() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        store.insert_bars("2317", rising(30));
        let counting = Counting::new("last_close", 1);
        let engine = orchestrator(
            registry(vec![counting.clone()]),
            &store,
            EngineSettings::default(),
        );
        let cancel = CancellationToken::new();
        let plan = CalculationPlan::for_date(run_date());

        let first = engine.run(&plan, &cancel).await.unwrap();
        assert_eq!(first.summary.succeeded, 2);
        assert_eq!(counting.calls(), 2);

        let second = engine.run(&plan, &cancel).await.unwrap();
        assert_eq!(second.summary.already_computed, 2);
        assert_eq!(second.summary.succeeded, 0);
        assert_eq!(counting.calls(), 2);

        let forced = engine.run(&plan.clone().forced(true), &cancel).await.unwrap();
        assert_eq!(forced.summary.succeeded, 2);
        assert_eq!(counting.calls(), 4);
        assert_eq!(
            forced.get("2330", "last_close"),
            first.get("2330", "last_close")
        );
    }

    #[tokio::test]
    async fn forced_subset_rerun_matches_full_run() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", wave(80));
        let engine = orchestrator(
            registry(vec![
                Arc::new(Ema::new(12, PriorityTier::P1)),
                Arc::new(Sma::new(60, PriorityTier::P0)),
            ]),
            &store,
            EngineSettings::default(),
        );
        let cancel = CancellationToken::new();
        let plan = CalculationPlan::for_date(run_date());

        let full = engine.run(&plan, &cancel).await.unwrap();
        let single = engine
            .run(&plan.clone().forced(true).only_calculators(["ema_12"]), &cancel)
            .await
            .unwrap();

        let full_values = full.get("2330", "ema_12").and_then(PairOutcome::values);
        assert!(full_values.is_some());
        assert_eq!(
            single.get("2330", "ema_12").and_then(PairOutcome::values),
            full_values
        );
        assert!(single.get("2330", "sma_60").is_none());
    }

    #[tokio::test]
    async fn failing_calculator_is_isolated_from_healthy_one() {
        let store = Arc::new(MemoryStore::new());
        for id in ["1101", "1102", "1103"] {
            store.insert_bars(id, rising(30));
        }
        let broken = Arc::new(AlwaysFails(CalculatorMetadata::new(
            "broken",
            Category::Trend,
            1,
            PriorityTier::P0,
        )));
        let engine = orchestrator(
            registry(vec![broken, Counting::new("last_close", 1)]),
            &store,
            EngineSettings::default(),
        );

        let result = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await;

        let outcome = result.unwrap();
        assert_eq!(outcome.summary.failed, 3);
        assert_eq!(outcome.summary.succeeded, 3);
        for id in ["1101", "1102", "1103"] {
            assert!(matches!(
                outcome.get(id, "broken"),
                Some(PairOutcome::Failed(FailureCause { kind: FailureKind::Calculation, .. }))
            ));
            assert!(store.stored(id, "last_close", run_date()).is_some());
        }
        assert_eq!(store.result_count(), 3);
    }

    #[tokio::test]
    async fn hung_existence_check_recomputes() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        let counting = Counting::new("last_close", 1);
        let settings = EngineSettings {
            persist_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let engine = orchestrator(registry(vec![counting.clone()]), &store, settings);
        let cancel = CancellationToken::new();
        let plan = CalculationPlan::for_date(run_date());

        engine.run(&plan, &cancel).await.unwrap();
        store.set_exists_delay(Duration::from_millis(500));
        let rerun = engine.run(&plan, &cancel).await.unwrap();

        assert!(matches!(
            rerun.get("2330", "last_close"),
            Some(PairOutcome::Computed { .. })
        ));
        assert_eq!(counting.calls(), 2);
    }

    #[tokio::test]
    async fn hung_universe_lookup_fails_the_run() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        store.set_universe_delay(Duration::from_millis(500));
        let settings = EngineSettings {
            persist_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let engine = orchestrator(registry(vec![Counting::new("last_close", 1)]), &store, settings);

        let err = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err.current_context(), EngineError::Universe));
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn bad_data_failures_are_isolated_per_stock() {
        let store = Arc::new(MemoryStore::new());
        for id in ["1101", "1102", "1103"] {
            store.insert_bars(id, rising(30));
        }
        for id in ["2201", "2202", "2203"] {
            let mut bars = rising(30);
            if let Some(last) = bars.last_mut() {
                last.close = f64::NAN;
            }
            store.insert_bars(id, bars);
        }
        let engine = orchestrator(
            registry(vec![Arc::new(Sma::new(20, PriorityTier::P0))]),
            &store,
            EngineSettings::default(),
        );

        let outcome = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.summary.succeeded, 3);
        assert_eq!(outcome.summary.failed, 3);
        assert_eq!(outcome.summary.failure_causes.len(), 1);
        for id in ["2201", "2202", "2203"] {
            assert!(matches!(
                outcome.get(id, "sma_20"),
                Some(PairOutcome::Failed(FailureCause { kind: FailureKind::Calculation, .. }))
            ));
        }
        assert_eq!(store.result_count(), 3);
    }

    #[tokio::test]
    async fn exact_priority_runs_only_that_tier() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(40));
        let engine = orchestrator(
            registry(vec![
                Arc::new(Sma::new(5, PriorityTier::P0)),
                Arc::new(Rsi::new(14, PriorityTier::P1)),
                Arc::new(BollingerBands::new(PriorityTier::P2)),
            ]),
            &store,
            EngineSettings::default(),
        );

        let plan = CalculationPlan::for_date(run_date())
            .with_priority(PriorityFilter::Exactly(PriorityTier::P0));
        let outcome = engine.run(&plan, &CancellationToken::new()).await.unwrap();

        let names: Vec<&str> = outcome.pairs().map(|(_, calc, _)| calc).collect();
        assert_eq!(names, ["sma_5"]);
    }

    #[tokio::test]
    async fn sink_failure_keeps_values_as_unpersisted() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        store.set_fail_persist(true);
        let engine = orchestrator(
            registry(vec![Counting::new("last_close", 1)]),
            &store,
            EngineSettings::default(),
        );

        let outcome = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .unwrap();

        match outcome.get("2330", "last_close").unwrap() {
            PairOutcome::Unpersisted { values, cause } => {
                assert_eq!(values["last"].as_number(), Some(30.0));
                assert_eq!(cause.kind, FailureKind::Sink);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(outcome.summary.unpersisted, 1);
        assert_eq!(outcome.summary.succeeded, 0);
        assert_eq!(store.result_count(), 0);
    }

    #[tokio::test]
    async fn fetch_timeout_fails_every_pending_pair() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        store.set_fetch_delay(Duration::from_millis(500));
        let settings = EngineSettings {
            fetch_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let counting = Counting::new("last_close", 1);
        let engine = orchestrator(
            registry(vec![counting.clone(), Arc::new(Sma::new(5, PriorityTier::P0))]),
            &store,
            settings,
        );

        let outcome = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.summary.failed, 2);
        for (_, _, pair) in outcome.pairs() {
            assert_eq!(pair.failure().map(|c| c.kind), Some(FailureKind::Timeout));
        }
        assert_eq!(counting.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_stock_is_data_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let engine = orchestrator(
            registry(vec![Counting::new("last_close", 1)]),
            &store,
            EngineSettings::default(),
        );

        let plan = CalculationPlan::for_date(run_date()).with_stocks(["9999"]);
        let outcome = engine.run(&plan, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.get("9999", "last_close").and_then(|o| o.failure()).map(|c| c.kind),
            Some(FailureKind::DataUnavailable)
        );
    }

    #[tokio::test]
    async fn non_finite_output_is_calculation_failure() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        let nan = Arc::new(NotANumber(CalculatorMetadata::new(
            "nan",
            Category::Trend,
            1,
            PriorityTier::P0,
        )));
        let engine = orchestrator(registry(vec![nan]), &store, EngineSettings::default());

        let outcome = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome.get("2330", "nan").and_then(|o| o.failure()).map(|c| c.kind),
            Some(FailureKind::Calculation)
        );
        assert_eq!(store.result_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_token_dispatches_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        let counting = Counting::new("last_close", 1);
        let engine = orchestrator(
            registry(vec![counting.clone()]),
            &store,
            EngineSettings::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine
            .run(&CalculationPlan::for_date(run_date()), &cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.stocks.is_empty());
        assert_eq!(store.fetch_count(), 0);
        assert_eq!(counting.calls(), 0);
    }

    #[tokio::test]
    async fn universe_failure_fails_the_run() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_universe(true);
        let engine = orchestrator(
            registry(vec![Counting::new("last_close", 1)]),
            &store,
            EngineSettings::default(),
        );

        let err = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err.current_context(), EngineError::Universe));
    }

    #[tokio::test]
    async fn series_fetched_once_per_stock() {
        let store = Arc::new(MemoryStore::new());
        store.insert_bars("2330", rising(30));
        store.insert_bars("2317", rising(30));
        let engine = orchestrator(
            registry(vec![
                Counting::new("a", 1),
                Counting::new("b", 1),
                Arc::new(Sma::new(20, PriorityTier::P0)),
            ]),
            &store,
            EngineSettings::default(),
        );

        let outcome = engine
            .run(&CalculationPlan::for_date(run_date()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.summary.succeeded, 6);
        assert_eq!(store.fetch_count(), 2);
    }
}
