use error_stack::Report;

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::error::CalculationError;
use crate::indicator::{close_prices, ema_series, sma_series};
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};

/// Simple Moving Average of closes.
///
/// Outputs `value` (latest SMA) and `deviation_pct` (close vs. SMA).
pub struct Sma {
    metadata: CalculatorMetadata,
    period: usize,
}

impl Sma {
    pub fn new(period: usize, priority: PriorityTier) -> Self {
        let metadata =
            CalculatorMetadata::new(format!("sma_{period}"), Category::Trend, period, priority)
                .with_params(CalcParams::from_pairs(&[("period", period as f64)]))
                .with_description(format!("{period}-day simple moving average of close"));
        Self { metadata, period }
    }
}

impl Calculator<PriceBar> for Sma {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        params
            .period_or("period", self.period)
            .max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let period = params.period("period", self.period)?;
        let prices = close_prices(series.tail(period))?;
        let sma = *sma_series(&prices, period)
            .last()
            .ok_or_else(|| window_error(period, prices.len()))?;
        let close = prices[prices.len() - 1];
        Ok(values([
            ("value", CalcValue::Number(sma)),
            ("deviation_pct", CalcValue::Number(deviation_pct(close, sma)?)),
        ]))
    }
}

/// Exponential Moving Average of closes.
///
/// The EMA is seeded `warmup` bars before the latest one, so the window read
/// is always `period + warmup` bars regardless of how much history is
/// available.
pub struct Ema {
    metadata: CalculatorMetadata,
    period: usize,
}

impl Ema {
    pub fn new(period: usize, priority: PriorityTier) -> Self {
        let metadata =
            CalculatorMetadata::new(format!("ema_{period}"), Category::Trend, period, priority)
                .with_params(CalcParams::from_pairs(&[
                    ("period", period as f64),
                    ("warmup", period as f64),
                ]))
                .with_description(format!("{period}-day exponential moving average of close"));
        Self { metadata, period }
    }
}

impl Calculator<PriceBar> for Ema {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        let period = params.period_or("period", self.period);
        (period + params.period_or("warmup", period)).max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let period = params.period("period", self.period)?;
        let warmup = params.period("warmup", period)?;
        let prices = close_prices(series.tail(period + warmup))?;
        let ema = *ema_series(&prices, period)
            .last()
            .ok_or_else(|| window_error(period, prices.len()))?;
        let close = prices[prices.len() - 1];
        Ok(values([
            ("value", CalcValue::Number(ema)),
            ("deviation_pct", CalcValue::Number(deviation_pct(close, ema)?)),
        ]))
    }
}

fn deviation_pct(close: f64, average: f64) -> Result<f64, Report<CalculationError>> {
    if average == 0.0 {
        return Err(Report::new(CalculationError::Undefined {
            reason: "moving average is zero".into(),
        }));
    }
    Ok((close - average) / average * 100.0)
}

pub(crate) fn window_error(required: usize, available: usize) -> Report<CalculationError> {
    Report::new(CalculationError::InvalidInput {
        reason: format!("window needs {required} observations, got {available}"),
    })
}
