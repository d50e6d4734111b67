use error_stack::Report;

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::error::CalculationError;
use crate::indicator::close_prices;
use crate::indicator::ma::window_error;
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};

/// RSI (Relative Strength Index) using Wilder's smoothing method.
///
/// Smoothing starts `warmup` deltas before the latest bar.
pub struct Rsi {
    metadata: CalculatorMetadata,
    period: usize,
}

impl Rsi {
    pub fn new(period: usize, priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            format!("rsi_{period}"),
            Category::Momentum,
            period + 1,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[
            ("period", period as f64),
            ("warmup", period as f64),
            ("overbought", 70.0),
            ("oversold", 30.0),
        ]))
        .with_description(format!("{period}-day RSI (Wilder)"));
        Self { metadata, period }
    }
}

impl Calculator<PriceBar> for Rsi {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        let period = params.period_or("period", self.period);
        (period + 1 + params.period_or("warmup", period)).max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let period = params.period("period", self.period)?;
        let warmup = params.period("warmup", period)?;
        let prices = close_prices(series.tail(period + 1 + warmup))?;
        if prices.len() < period + 1 {
            return Err(window_error(period + 1, prices.len()));
        }

        let rsi = wilder_rsi(&prices, period);
        let overbought = params.get_f64("overbought", 70.0);
        let oversold = params.get_f64("oversold", 30.0);
        let zone = if rsi >= overbought {
            "overbought"
        } else if rsi <= oversold {
            "oversold"
        } else {
            "neutral"
        };

        Ok(values([
            ("value", CalcValue::Number(rsi)),
            ("zone", CalcValue::from(zone)),
        ]))
    }
}

/// Latest RSI value. `prices` must hold at least `period + 1` values.
fn wilder_rsi(prices: &[f64], period: usize) -> f64 {
    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    // Seed using simple average of first `period` gains/losses
    let mut avg_gain = deltas[..period].iter().map(|&d| d.max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss =
        deltas[..period].iter().map(|&d| (-d).max(0.0)).sum::<f64>() / period as f64;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period - 1) as f64 + gain) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss) / period as f64;
    }

    rsi_value(avg_gain, avg_loss)
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
