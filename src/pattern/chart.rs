use error_stack::Report;

use crate::calculator::{CalcParams, CalcValues, Calculator, CalculatorMetadata};
use crate::error::CalculationError;
use crate::indicator::ma::window_error;
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};
use crate::pattern::{Candle, Direction, detection};

const BREAKOUT_LOOKBACK: usize = 20;

/// Close above the highest high of the prior `lookback` bars on expanding
/// volume.
pub struct Breakout {
    metadata: CalculatorMetadata,
}

impl Breakout {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            "breakout_20",
            Category::ChartPattern,
            BREAKOUT_LOOKBACK + 1,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[
            ("lookback", BREAKOUT_LOOKBACK as f64),
            ("volume_multiple", 1.5),
        ]))
        .with_description("close above the prior 20-day high on 1.5x volume");
        Self { metadata }
    }
}

impl Calculator<PriceBar> for Breakout {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        (params.period_or("lookback", BREAKOUT_LOOKBACK) + 1).max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let lookback = params.period("lookback", BREAKOUT_LOOKBACK)?;
        let volume_multiple = params.get_f64("volume_multiple", 1.5);
        let bars = series.tail(lookback + 1);
        if bars.len() < lookback + 1 {
            return Err(window_error(lookback + 1, bars.len()));
        }
        let (prior, today) = bars.split_at(lookback);
        let today = &today[0];
        Candle::of(today)?;

        let prior_high = prior.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let avg_volume = prior.iter().map(|b| b.volume).sum::<f64>() / lookback as f64;
        let volume_ratio = if avg_volume > 0.0 {
            today.volume / avg_volume
        } else {
            0.0
        };

        let matched = (today.close > prior_high && volume_ratio >= volume_multiple).then(|| {
            let confidence = (volume_ratio / (volume_multiple * 2.0)).min(1.0);
            (confidence, Direction::Bullish)
        });
        Ok(detection(matched))
    }
}

const DOUBLE_BOTTOM_LOOKBACK: usize = 40;

/// Two comparable lows separated by a rebound, confirmed by a close above
/// the intervening peak.
pub struct DoubleBottom {
    metadata: CalculatorMetadata,
}

impl DoubleBottom {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            "double_bottom",
            Category::ChartPattern,
            DOUBLE_BOTTOM_LOOKBACK,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[
            ("lookback", DOUBLE_BOTTOM_LOOKBACK as f64),
            ("tolerance", 0.03),
            ("min_rebound", 0.05),
            ("min_separation", 5.0),
        ]))
        .with_description("W-shaped bottom confirmed above the neckline");
        Self { metadata }
    }
}

impl Calculator<PriceBar> for DoubleBottom {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn required_points(&self, params: &CalcParams) -> usize {
        params
            .period_or("lookback", DOUBLE_BOTTOM_LOOKBACK)
            .max(self.metadata.min_data_points)
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let lookback = params.period("lookback", DOUBLE_BOTTOM_LOOKBACK)?;
        let tolerance = params.get_f64("tolerance", 0.03);
        let min_rebound = params.get_f64("min_rebound", 0.05);
        let min_separation = params.period("min_separation", 5)?;

        let bars = series.tail(lookback);
        if bars.len() < lookback {
            return Err(window_error(lookback, bars.len()));
        }
        for bar in bars {
            Candle::of(bar)?;
        }

        // Lows are searched before the latest bar, which is the confirmation.
        let history = &bars[..bars.len() - 1];
        let half = history.len() / 2;
        let (first_idx, first_low) = lowest(&history[..half], 0);
        let (second_idx, second_low) = lowest(&history[half..], half);
        let today = &bars[bars.len() - 1];

        let floor = first_low.min(second_low);
        if floor <= 0.0 || second_idx - first_idx < min_separation {
            return Ok(detection(None));
        }

        let neckline = history[first_idx..=second_idx]
            .iter()
            .map(|b| b.high)
            .fold(f64::MIN, f64::max);
        let spread = (first_low - second_low).abs() / floor;

        let matched = (spread <= tolerance
            && neckline >= floor * (1.0 + min_rebound)
            && today.close > neckline)
            .then(|| {
                let confidence = if tolerance > 0.0 {
                    1.0 - spread / tolerance
                } else {
                    1.0
                };
                (confidence, Direction::Bullish)
            });
        Ok(detection(matched))
    }
}

/// Index (offset into the full window) and value of the lowest low.
fn lowest(bars: &[PriceBar], offset: usize) -> (usize, f64) {
    bars.iter()
        .enumerate()
        .fold((offset, f64::MAX), |(best_idx, best), (i, b)| {
            if b.low < best {
                (offset + i, b.low)
            } else {
                (best_idx, best)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{bars_ending, date, series_from_bars};

    #[test]
    fn breakout_on_volume() {
        let breakout = Breakout::new(PriorityTier::P0);
        let mut bars = bars_ending(date("2025-01-21"), &[100.0; 21]);
        let last = bars.last_mut().unwrap();
        last.close = 105.0;
        last.high = 106.0;
        last.volume = 4_000.0;
        let out = breakout
            .calculate(&series_from_bars(bars), &breakout.metadata().default_params)
            .unwrap();
        assert_eq!(out["detected"].as_flag(), Some(true));
        assert_eq!(out["confidence"].as_number(), Some(1.0));
    }

    #[test]
    fn breakout_needs_volume() {
        let breakout = Breakout::new(PriorityTier::P0);
        let mut bars = bars_ending(date("2025-01-21"), &[100.0; 21]);
        let last = bars.last_mut().unwrap();
        last.close = 105.0;
        last.high = 106.0;
        let out = breakout
            .calculate(&series_from_bars(bars), &breakout.metadata().default_params)
            .unwrap();
        assert_eq!(out["detected"].as_flag(), Some(false));
    }

    #[test]
    fn double_bottom_confirmed() {
        let calc = DoubleBottom::new(PriorityTier::P2);
        // decline to 90, rebound to 100, retest 90.5, break out to 102
        let mut closes = Vec::new();
        closes.extend((0..10).map(|i| 110.0 - 2.0 * i as f64)); // 110 .. 92
        closes.push(90.0);
        closes.extend((1..=8).map(|i| 90.0 + 1.25 * i as f64)); // .. 100
        closes.extend((1..=10).map(|i| 100.0 - 0.95 * i as f64)); // .. 90.5
        closes.extend((1..=10).map(|i| 90.5 + 0.9 * i as f64)); // .. 99.5
        closes.push(102.0);
        assert_eq!(closes.len(), 40);
        let bars = bars_ending(date("2025-02-09"), &closes);
        let out = calc
            .calculate(&series_from_bars(bars), &calc.metadata().default_params)
            .unwrap();
        assert_eq!(out["detected"].as_flag(), Some(true));
        assert_eq!(out["direction"].as_text(), Some("bullish"));
    }

    #[test]
    fn steady_decline_is_not_double_bottom() {
        let calc = DoubleBottom::new(PriorityTier::P2);
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        let bars = bars_ending(date("2025-02-09"), &closes);
        let out = calc
            .calculate(&series_from_bars(bars), &calc.metadata().default_params)
            .unwrap();
        assert_eq!(out["detected"].as_flag(), Some(false));
    }
}
