pub mod bollinger;
pub mod ma;
pub mod macd;
pub mod rsi;
pub mod volume;

use std::sync::Arc;

use error_stack::{Report, bail};

use crate::calculator::Calculator;
use crate::error::CalculationError;
use crate::model::{PriceBar, PriorityTier};

/// The built-in technical indicator set.
pub fn defaults() -> Vec<Arc<dyn Calculator<PriceBar>>> {
    vec![
        Arc::new(ma::Sma::new(5, PriorityTier::P0)),
        Arc::new(ma::Sma::new(20, PriorityTier::P0)),
        Arc::new(ma::Sma::new(60, PriorityTier::P0)),
        Arc::new(volume::VolumeMa::new(20, PriorityTier::P0)),
        Arc::new(ma::Ema::new(12, PriorityTier::P1)),
        Arc::new(ma::Ema::new(26, PriorityTier::P1)),
        Arc::new(rsi::Rsi::new(14, PriorityTier::P1)),
        Arc::new(macd::Macd::new(PriorityTier::P1)),
        Arc::new(bollinger::BollingerBands::new(PriorityTier::P2)),
    ]
}

/// Extract close prices, rejecting values no indicator can interpret.
pub fn close_prices(bars: &[PriceBar]) -> Result<Vec<f64>, Report<CalculationError>> {
    bars.iter()
        .map(|b| checked(b.close, "close", b))
        .collect()
}

/// Extract volumes, rejecting negative or non-finite values.
pub fn volumes(bars: &[PriceBar]) -> Result<Vec<f64>, Report<CalculationError>> {
    bars.iter()
        .map(|b| checked(b.volume, "volume", b))
        .collect()
}

fn checked(value: f64, field: &str, bar: &PriceBar) -> Result<f64, Report<CalculationError>> {
    if !value.is_finite() || value < 0.0 {
        bail!(CalculationError::InvalidInput {
            reason: format!("{field} {value} at {} is not a valid quantity", bar.date),
        });
    }
    Ok(value)
}

/// Simple moving average over every full window of `prices`.
pub fn sma_series(prices: &[f64], period: usize) -> Vec<f64> {
    prices
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

/// EMA seeded with the SMA of the first `period` values. Empty when
/// `prices` is shorter than `period`.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    let mut results = vec![ema];
    for &price in &prices[period..] {
        ema = price * k + ema * (1.0 - k);
        results.push(ema);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::bars_ending;
    use crate::model::fixtures::date;

    #[test]
    fn default_names_are_unique() {
        let calcs = defaults();
        let mut names: Vec<&str> = calcs.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), calcs.len());
    }

    #[test]
    fn close_prices_rejects_nan() {
        let mut bars = bars_ending(date("2025-01-02"), &[1.0, 2.0]);
        bars[0].close = f64::NAN;
        assert!(close_prices(&bars).is_err());
    }

    #[test]
    fn ema_seed_equals_sma() {
        let ema = ema_series(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!((ema[0] - 2.0).abs() < 1e-9);
        assert_eq!(ema.len(), 2);
        assert!(ema_series(&[1.0], 3).is_empty());
    }
}
