use error_stack::Report;

use crate::calculator::{
    CalcParams, CalcValue, CalcValues, Calculator, CalculatorMetadata, values,
};
use crate::chip::finite;
use crate::error::CalculationError;
use crate::model::{Category, ChipRecord, PriorityTier, TimeSeries};

/// Net buy/sell of the three institutional investor groups summed over the
/// trailing `days`.
pub struct InstitutionalNet {
    metadata: CalculatorMetadata,
    days: usize,
}

impl InstitutionalNet {
    pub fn new(days: usize, priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            format!("institutional_net_{days}d"),
            Category::InstitutionalFlow,
            days,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[("days", days as f64)]))
        .with_description(format!("{days}-day institutional net buy/sell"));
        Self { metadata, days }
    }
}

impl Calculator<ChipRecord> for InstitutionalNet {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        params
            .period_or("days", self.days)
            .max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<ChipRecord>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let days = params.period("days", self.days)?;
        let window = series.tail(days);

        let (mut foreign, mut trust, mut dealer) = (0.0, 0.0, 0.0);
        for record in window {
            foreign += finite(record.foreign_net, "foreign_net", record)?;
            trust += finite(record.trust_net, "trust_net", record)?;
            dealer += finite(record.dealer_net, "dealer_net", record)?;
        }

        Ok(values([
            ("foreign", CalcValue::Number(foreign)),
            ("trust", CalcValue::Number(trust)),
            ("dealer", CalcValue::Number(dealer)),
            ("total", CalcValue::Number(foreign + trust + dealer)),
        ]))
    }
}

const STREAK_MAX_DAYS: usize = 20;

/// Consecutive days of foreign net buying (positive streak) or selling
/// (negative streak), counted back from the latest record and capped at
/// `max_days`.
pub struct ForeignStreak {
    metadata: CalculatorMetadata,
}

impl ForeignStreak {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            "foreign_streak",
            Category::InstitutionalFlow,
            1,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[("max_days", STREAK_MAX_DAYS as f64)]))
        .with_description("consecutive days of foreign net buying or selling");
        Self { metadata }
    }
}

impl Calculator<ChipRecord> for ForeignStreak {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        params
            .period_or("max_days", STREAK_MAX_DAYS)
            .max(self.metadata.min_data_points)
    }

    /// A single record is enough; a shorter history only caps the streak.
    fn has_enough_data(&self, series: &TimeSeries<ChipRecord>, _params: &CalcParams) -> bool {
        series.len() >= self.metadata.min_data_points
    }

    fn calculate(
        &self,
        series: &TimeSeries<ChipRecord>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let max_days = params.period("max_days", STREAK_MAX_DAYS)?;
        let mut direction = 0.0_f64;
        let mut streak = 0usize;
        for record in series.tail(max_days).iter().rev() {
            let net = finite(record.foreign_net, "foreign_net", record)?;
            // f64::signum maps 0.0 to 1.0
            let sign = if net == 0.0 { 0.0 } else { net.signum() };
            if streak == 0 {
                if sign == 0.0 {
                    break;
                }
                direction = sign;
            } else if sign != direction {
                break;
            }
            streak += 1;
        }

        let label = match direction {
            d if d > 0.0 => "buy",
            d if d < 0.0 => "sell",
            _ => "flat",
        };
        Ok(values([
            ("streak", CalcValue::Number(direction * streak as f64)),
            ("direction", CalcValue::from(label)),
        ]))
    }
}
