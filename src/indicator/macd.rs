use error_stack::{Report, bail};

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::error::CalculationError;
use crate::indicator::ma::window_error;
use crate::indicator::{close_prices, ema_series};
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};

const FAST: usize = 12;
const SLOW: usize = 26;
const SIGNAL: usize = 9;

/// MACD line, signal line and histogram for the latest bar.
pub struct Macd {
    metadata: CalculatorMetadata,
}

impl Macd {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata =
            CalculatorMetadata::new("macd", Category::Momentum, SLOW + SIGNAL - 1, priority)
                .with_params(CalcParams::from_pairs(&[
                    ("fast_period", FAST as f64),
                    ("slow_period", SLOW as f64),
                    ("signal_period", SIGNAL as f64),
                    ("warmup", SLOW as f64),
                ]))
                .with_description("MACD (12, 26, 9) of close");
        Self { metadata }
    }
}

struct Periods {
    fast: usize,
    slow: usize,
    signal: usize,
    warmup: usize,
}

impl Periods {
    fn from_params(params: &CalcParams) -> Result<Self, Report<CalculationError>> {
        let periods = Self {
            fast: params.period("fast_period", FAST)?,
            slow: params.period("slow_period", SLOW)?,
            signal: params.period("signal_period", SIGNAL)?,
            warmup: params.period("warmup", SLOW)?,
        };
        if periods.fast >= periods.slow {
            bail!(CalculationError::InvalidParameter {
                name: "fast_period must be < slow_period".into(),
            });
        }
        Ok(periods)
    }

    fn required(&self) -> usize {
        self.slow + self.signal - 1
    }

    /// Bars read: the minimum plus the smoothing warm-up.
    fn window(&self) -> usize {
        self.required() + self.warmup
    }
}

impl Calculator<PriceBar> for Macd {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        Periods::from_params(params)
            .map(|p| p.window())
            .unwrap_or(self.metadata.min_data_points)
            .max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let periods = Periods::from_params(params)?;
        let prices = close_prices(series.tail(periods.window()))?;
        if prices.len() < periods.required() {
            return Err(window_error(periods.required(), prices.len()));
        }

        let fast_ema = ema_series(&prices, periods.fast);
        let slow_ema = ema_series(&prices, periods.slow);

        // Align: slow_ema is shorter by (slow - fast) elements
        let offset = periods.slow - periods.fast;
        let macd_line: Vec<f64> = fast_ema[offset..]
            .iter()
            .zip(slow_ema.iter())
            .map(|(f, s)| f - s)
            .collect();

        let signal_line = ema_series(&macd_line, periods.signal);
        let (Some(&macd), Some(&signal)) = (macd_line.last(), signal_line.last()) else {
            return Err(window_error(periods.required(), prices.len()));
        };

        Ok(values([
            ("macd", CalcValue::Number(macd)),
            ("signal", CalcValue::Number(signal)),
            ("histogram", CalcValue::Number(macd - signal)),
        ]))
    }
}
