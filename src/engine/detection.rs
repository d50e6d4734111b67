use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::calculator::CalcValues;
use crate::engine::Orchestrator;
use crate::engine::outcome::{AggregatedOutcome, PairOutcome, RunSummary};
use crate::engine::plan::CalculationPlan;
use crate::error::EngineError;
use crate::model::{Category, PriceBar};
use crate::storage::{ResultReader, TradingCalendar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// Every pattern calculator.
    #[default]
    Full,
    /// Candlestick patterns only.
    Quick,
}

#[derive(Debug, Clone)]
pub struct DetectionPlan {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub stock_id: Option<String>,
    pub mode: DetectionMode,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    pub stock_id: String,
    pub date: NaiveDate,
    pub pattern: String,
    pub confidence: f64,
    pub direction: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionResult {
    pub matches: Vec<PatternMatch>,
    /// Counters summed over every trading date in the range.
    pub summary: RunSummary,
    pub dates: usize,
    pub cancelled: bool,
}

/// Runs the pattern registry over a date range and collects positive
/// detections.
pub struct Detector {
    orchestrator: Arc<Orchestrator<PriceBar>>,
    calendar: Arc<dyn TradingCalendar>,
    reader: Arc<dyn ResultReader>,
}

impl Detector {
    pub fn new(
        orchestrator: Arc<Orchestrator<PriceBar>>,
        calendar: Arc<dyn TradingCalendar>,
        reader: Arc<dyn ResultReader>,
    ) -> Self {
        Self {
            orchestrator,
            calendar,
            reader,
        }
    }

    pub async fn detect(
        &self,
        plan: &DetectionPlan,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, Report<EngineError>> {
        if plan.from > plan.to {
            bail!(EngineError::InvalidPlan {
                reason: format!("from {} is after to {}", plan.from, plan.to),
            });
        }

        let dates = self
            .calendar
            .trading_dates(plan.from, plan.to)
            .await
            .change_context(EngineError::Calendar)?;

        info!(
            from = %plan.from,
            to = %plan.to,
            mode = ?plan.mode,
            dates = dates.len(),
            "starting pattern detection"
        );

        let mut result = DetectionResult {
            dates: dates.len(),
            ..DetectionResult::default()
        };
        for date in dates {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let outcome = self.orchestrator.run(&self.daily_plan(plan, date), cancel).await?;
            result.summary.absorb(&outcome.summary);
            result.cancelled |= outcome.cancelled;
            self.collect_matches(&outcome, &mut result.matches).await;
        }

        info!(
            matches = result.matches.len(),
            summary = %result.summary,
            "pattern detection finished"
        );
        Ok(result)
    }

    fn daily_plan(&self, plan: &DetectionPlan, date: NaiveDate) -> CalculationPlan {
        let mut daily = CalculationPlan::for_date(date).forced(plan.force);
        if let Some(stock_id) = &plan.stock_id {
            daily = daily.with_stocks([stock_id.as_str()]);
        }
        if plan.mode == DetectionMode::Quick {
            daily = daily.only_categories(BTreeSet::from([Category::Candlestick]));
        }
        daily
    }

    async fn collect_matches(&self, outcome: &AggregatedOutcome, matches: &mut Vec<PatternMatch>) {
        for (stock_id, pattern, pair) in outcome.pairs() {
            let values = match pair {
                PairOutcome::AlreadyComputed => {
                    match self.reader.get_result(stock_id, pattern, outcome.date).await {
                        Ok(Some(values)) => values,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(error = ?e, stock_id, pattern, "failed to load stored detection");
                            continue;
                        }
                    }
                }
                other => match other.values() {
                    Some(values) => values.clone(),
                    None => continue,
                },
            };
            if let Some(found) = as_match(stock_id, outcome.date, pattern, &values) {
                matches.push(found);
            }
        }
    }
}

fn as_match(
    stock_id: &str,
    date: NaiveDate,
    pattern: &str,
    values: &CalcValues,
) -> Option<PatternMatch> {
    if values.get("detected").and_then(|v| v.as_flag()) != Some(true) {
        return None;
    }
    Some(PatternMatch {
        stock_id: stock_id.to_string(),
        date,
        pattern: pattern.to_string(),
        confidence: values
            .get("confidence")
            .and_then(|v| v.as_number())
            .unwrap_or_default(),
        direction: values
            .get("direction")
            .and_then(|v| v.as_text())
            .unwrap_or("neutral")
            .to_string(),
    })
}
