use error_stack::{Report, bail};

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::chip::finite;
use crate::error::CalculationError;
use crate::model::{Category, ChipRecord, PriorityTier, TimeSeries};

/// Change in major-holder (large shareholder) ratio across the last
/// `observations` published distribution snapshots.
///
/// Distribution data is weekly, so most daily records carry no ratio; the
/// sufficiency check counts populated records rather than series length.
pub struct Concentration {
    metadata: CalculatorMetadata,
    observations: usize,
}

impl Concentration {
    pub fn new(observations: usize, priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            "major_holder_concentration",
            Category::Concentration,
            observations,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[(
            "observations",
            observations as f64,
        )]))
        .with_description("change in major-holder ratio across recent snapshots");
        Self {
            metadata,
            observations,
        }
    }

    /// The latest `wanted` populated records inside the trailing window.
    fn snapshots<'a>(
        &self,
        series: &'a TimeSeries<ChipRecord>,
        params: &CalcParams,
        wanted: usize,
    ) -> Vec<(&'a ChipRecord, f64)> {
        let mut snapshots: Vec<(&ChipRecord, f64)> = series
            .tail(self.required_points(params))
            .iter()
            .rev()
            .filter_map(|r| r.major_holder_ratio.map(|ratio| (r, ratio)))
            .take(wanted)
            .collect();
        snapshots.reverse();
        snapshots
    }
}

impl Calculator<ChipRecord> for Concentration {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        // Weekly snapshots inside daily records: roughly five days each.
        params.period_or("observations", self.observations) * 5
    }

    fn has_enough_data(&self, series: &TimeSeries<ChipRecord>, params: &CalcParams) -> bool {
        let wanted = params.period_or("observations", self.observations);
        self.snapshots(series, params, wanted).len() >= wanted
    }

    fn calculate(
        &self,
        series: &TimeSeries<ChipRecord>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let wanted = params.period("observations", self.observations)?;
        let snapshots = self.snapshots(series, params, wanted);
        let (Some(&(first, first_ratio)), Some(&(last, last_ratio))) =
            (snapshots.first(), snapshots.last())
        else {
            bail!(CalculationError::InvalidInput {
                reason: "no major-holder snapshots in window".into(),
            });
        };
        finite(first_ratio, "major_holder_ratio", first)?;
        finite(last_ratio, "major_holder_ratio", last)?;

        let mut out = values([
            ("ratio", CalcValue::Number(last_ratio)),
            ("change", CalcValue::Number(last_ratio - first_ratio)),
        ]);
        if let (Some(before), Some(after)) = (first.holder_count, last.holder_count) {
            out.insert(
                "holder_count_change".into(),
                CalcValue::Number((after - before) as f64),
            );
        }
        Ok(out)
    }
}

/// Short balance relative to margin balance on the latest record.
pub struct MarginShort {
    metadata: CalculatorMetadata,
}

impl MarginShort {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new("margin_short_ratio", Category::Margin, 1, priority)
            .with_description("short balance / margin balance");
        Self { metadata }
    }
}

impl Calculator<ChipRecord> for MarginShort {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn has_enough_data(&self, series: &TimeSeries<ChipRecord>, _params: &CalcParams) -> bool {
        series
            .last()
            .is_some_and(|r| r.margin_balance.is_some() && r.short_balance.is_some())
    }

    fn calculate(
        &self,
        series: &TimeSeries<ChipRecord>,
        _params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let Some(record) = series.last() else {
            bail!(CalculationError::InvalidInput {
                reason: "empty series".into(),
            });
        };
        let (Some(margin), Some(short)) = (record.margin_balance, record.short_balance) else {
            bail!(CalculationError::InvalidInput {
                reason: format!("margin data missing at {}", record.date),
            });
        };
        let margin = finite(margin, "margin_balance", record)?;
        let short = finite(short, "short_balance", record)?;
        if margin <= 0.0 {
            bail!(CalculationError::Undefined {
                reason: format!("margin balance is {margin} at {}", record.date),
            });
        }

        Ok(values([
            ("ratio_pct", CalcValue::Number(short / margin * 100.0)),
            ("margin_balance", CalcValue::Number(margin)),
            ("short_balance", CalcValue::Number(short)),
        ]))
    }
}
