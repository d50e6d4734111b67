use error_stack::Report;

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::error::CalculationError;
use crate::indicator::ma::window_error;
use crate::indicator::volumes;
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};

/// Volume Moving Average: simple average of trading volume over a period.
pub struct VolumeMa {
    metadata: CalculatorMetadata,
    period: usize,
}

impl VolumeMa {
    pub fn new(period: usize, priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            format!("volume_ma_{period}"),
            Category::Volume,
            period,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[
            ("period", period as f64),
            ("surge_multiplier", 2.0),
        ]))
        .with_description(format!("{period}-day volume average and surge flag"));
        Self { metadata, period }
    }
}

impl Calculator<PriceBar> for VolumeMa {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        params
            .period_or("period", self.period)
            .max(self.metadata.min_data_points)
    }

    /// `ratio` and `surge` are omitted when the average is zero (suspended
    /// trading).
    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let period = params.period("period", self.period)?;
        let vols = volumes(series.tail(period))?;
        if vols.len() < period {
            return Err(window_error(period, vols.len()));
        }

        let ma = vols.iter().sum::<f64>() / period as f64;
        let mut out = values([("value", CalcValue::Number(ma))]);
        if ma > 0.0 {
            let ratio = vols[vols.len() - 1] / ma;
            let surge_multiplier = params.get_f64("surge_multiplier", 2.0);
            out.insert("ratio".into(), CalcValue::Number(ratio));
            out.insert("surge".into(), CalcValue::Flag(ratio > surge_multiplier));
        }
        Ok(out)
    }
}
