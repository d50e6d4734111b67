pub mod flow;
pub mod holding;

use std::sync::Arc;

use error_stack::{Report, bail};

use crate::calculator::Calculator;
use crate::error::CalculationError;
use crate::model::{ChipRecord, PriorityTier};

/// The built-in ownership ("chip") calculator set.
pub fn defaults() -> Vec<Arc<dyn Calculator<ChipRecord>>> {
    vec![
        Arc::new(flow::InstitutionalNet::new(5, PriorityTier::P0)),
        Arc::new(flow::InstitutionalNet::new(20, PriorityTier::P1)),
        Arc::new(flow::ForeignStreak::new(PriorityTier::P1)),
        Arc::new(holding::Concentration::new(4, PriorityTier::P2)),
        Arc::new(holding::MarginShort::new(PriorityTier::P2)),
    ]
}

/// Reject non-finite flow figures; they indicate a broken upstream record.
pub(crate) fn finite(
    value: f64,
    field: &str,
    record: &ChipRecord,
) -> Result<f64, Report<CalculationError>> {
    if !value.is_finite() {
        bail!(CalculationError::InvalidInput {
            reason: format!("{field} at {} is not finite", record.date),
        });
    }
    Ok(value)
}
