use error_stack::{Report, bail};

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::error::CalculationError;
use crate::indicator::close_prices;
use crate::indicator::ma::window_error;
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};

const PERIOD: usize = 20;

pub struct BollingerBands {
    metadata: CalculatorMetadata,
}

impl BollingerBands {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            format!("bollinger_{PERIOD}"),
            Category::Volatility,
            PERIOD,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[
            ("period", PERIOD as f64),
            ("std_dev_multiplier", 2.0),
        ]))
        .with_description("Bollinger bands (20, 2σ) of close");
        Self { metadata }
    }
}

impl Calculator<PriceBar> for BollingerBands {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        params
            .period_or("period", PERIOD)
            .max(self.metadata.min_data_points)
    }

    /// Outputs upper/middle/lower bands and bandwidth. `percent_b` is only
    /// present when the bands have non-zero width.
    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let period = params.period("period", PERIOD)?;
        let multiplier = params.get_f64("std_dev_multiplier", 2.0);
        if !(multiplier.is_finite() && multiplier > 0.0) {
            bail!(CalculationError::InvalidParameter {
                name: "std_dev_multiplier must be > 0".into(),
            });
        }

        let prices = close_prices(series.tail(period))?;
        if prices.len() < period {
            return Err(window_error(period, prices.len()));
        }

        let middle = prices.iter().sum::<f64>() / period as f64;
        let variance = prices.iter().map(|&p| (p - middle).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();
        let upper = middle + multiplier * std_dev;
        let lower = middle - multiplier * std_dev;
        if middle == 0.0 {
            bail!(CalculationError::Undefined {
                reason: "middle band is zero".into(),
            });
        }

        let mut out = values([
            ("upper", CalcValue::Number(upper)),
            ("middle", CalcValue::Number(middle)),
            ("lower", CalcValue::Number(lower)),
            ("bandwidth", CalcValue::Number((upper - lower) / middle)),
        ]);
        if upper > lower {
            let close = prices[prices.len() - 1];
            out.insert(
                "percent_b".into(),
                CalcValue::Number((close - lower) / (upper - lower)),
            );
        }
        Ok(out)
    }
}
