use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::calculator::CalcValues;
use crate::model::Family;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DataUnavailable,
    MalformedSeries,
    Calculation,
    Timeout,
    Sink,
    Source,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataUnavailable => "data_unavailable",
            Self::MalformedSeries => "malformed_series",
            Self::Calculation => "calculation",
            Self::Timeout => "timeout",
            Self::Sink => "sink",
            Self::Source => "source",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientData { required: usize, available: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData {
                required,
                available,
            } => write!(f, "insufficient data ({available}/{required})"),
        }
    }
}

/// Result of one (stock, calculator) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairOutcome {
    Computed { values: CalcValues },
    /// Computed, but the sink rejected the write.
    Unpersisted { values: CalcValues, cause: FailureCause },
    AlreadyComputed,
    Skipped(SkipReason),
    Failed(FailureCause),
}

impl PairOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed(FailureCause::new(kind, message))
    }

    /// Values produced by this run, persisted or not.
    pub fn values(&self) -> Option<&CalcValues> {
        match self {
            Self::Computed { values } | Self::Unpersisted { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        match self {
            Self::Failed(cause) | Self::Unpersisted { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Computed { .. } => "computed",
            Self::Unpersisted { .. } => "unpersisted",
            Self::AlreadyComputed => "already_computed",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub already_computed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unpersisted: usize,
    pub failure_causes: BTreeSet<String>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &PairOutcome) {
        match outcome {
            PairOutcome::Computed { .. } => self.succeeded += 1,
            PairOutcome::AlreadyComputed => self.already_computed += 1,
            PairOutcome::Skipped(_) => self.skipped += 1,
            PairOutcome::Failed(cause) => {
                self.failed += 1;
                self.failure_causes.insert(cause.to_string());
            }
            PairOutcome::Unpersisted { cause, .. } => {
                self.unpersisted += 1;
                self.failure_causes.insert(cause.to_string());
            }
        }
    }

    pub fn absorb(&mut self, other: &RunSummary) {
        self.succeeded += other.succeeded;
        self.already_computed += other.already_computed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.unpersisted += other.unpersisted;
        self.failure_causes
            .extend(other.failure_causes.iter().cloned());
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.already_computed + self.skipped + self.failed + self.unpersisted
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded={} already_computed={} skipped={} failed={} unpersisted={}",
            self.succeeded, self.already_computed, self.skipped, self.failed, self.unpersisted
        )
    }
}

pub type StockOutcomes = BTreeMap<String, PairOutcome>;

/// Everything one run produced, keyed by stock then calculator.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedOutcome {
    pub run_id: Uuid,
    pub family: Family,
    pub date: NaiveDate,
    pub stocks: BTreeMap<String, StockOutcomes>,
    pub summary: RunSummary,
    pub cancelled: bool,
}

impl AggregatedOutcome {
    pub fn from_stocks(
        run_id: Uuid,
        family: Family,
        date: NaiveDate,
        stocks: BTreeMap<String, StockOutcomes>,
        cancelled: bool,
    ) -> Self {
        let mut summary = RunSummary::default();
        for outcome in stocks.values().flat_map(|pairs| pairs.values()) {
            summary.record(outcome);
        }
        Self {
            run_id,
            family,
            date,
            stocks,
            summary,
            cancelled,
        }
    }

    pub fn get(&self, stock_id: &str, calculator: &str) -> Option<&PairOutcome> {
        self.stocks.get(stock_id)?.get(calculator)
    }

    /// `(stock, calculator, outcome)` in key order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str, &PairOutcome)> {
        self.stocks.iter().flat_map(|(stock, pairs)| {
            pairs
                .iter()
                .map(move |(calc, outcome)| (stock.as_str(), calc.as_str(), outcome))
        })
    }
}
