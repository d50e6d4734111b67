use error_stack::Report;

use crate::calculator::{CalcParams, CalcValues, Calculator, CalculatorMetadata};
use crate::error::CalculationError;
use crate::pattern::{Candle, Direction, detection};
use crate::indicator::ma::window_error;
use crate::model::{Category, PriceBar, PriorityTier, TimeSeries};

fn latest(
    series: &TimeSeries<PriceBar>,
    n: usize,
) -> Result<Vec<Candle>, Report<CalculationError>> {
    let bars = series.tail(n);
    if bars.len() < n {
        return Err(window_error(n, bars.len()));
    }
    bars.iter().map(Candle::of).collect()
}

/// Open and close nearly equal relative to the day's range.
pub struct Doji {
    metadata: CalculatorMetadata,
}

impl Doji {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new("doji", Category::Candlestick, 1, priority)
            .with_params(CalcParams::from_pairs(&[("body_ratio", 0.1)]))
            .with_description("body at most body_ratio of the range");
        Self { metadata }
    }
}

impl Calculator<PriceBar> for Doji {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let body_ratio = params.get_f64("body_ratio", 0.1);
        let candle = &latest(series, 1)?[0];
        let range = candle.range();
        if range <= 0.0 {
            return Ok(detection(None));
        }

        let ratio = candle.body() / range;
        let matched = (ratio <= body_ratio).then(|| {
            let confidence = if body_ratio > 0.0 {
                1.0 - ratio / body_ratio
            } else {
                1.0
            };
            (confidence, Direction::Neutral)
        });
        Ok(detection(matched))
    }
}

/// Long lower shadow, small upper shadow, after a decline.
pub struct Hammer {
    metadata: CalculatorMetadata,
}

const HAMMER_TREND_BARS: usize = 5;

impl Hammer {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new(
            "hammer",
            Category::Candlestick,
            HAMMER_TREND_BARS + 1,
            priority,
        )
        .with_params(CalcParams::from_pairs(&[("shadow_multiple", 2.0)]))
        .with_description("hammer after a short decline");
        Self { metadata }
    }
}

impl Calculator<PriceBar> for Hammer {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let multiple = params.get_f64("shadow_multiple", 2.0);
        let candles = latest(series, HAMMER_TREND_BARS + 1)?;
        let today = &candles[HAMMER_TREND_BARS];
        let declining = candles[0].close > candles[HAMMER_TREND_BARS - 1].close;

        let body = today.body();
        let shaped = body > 0.0
            && today.lower_shadow() >= multiple * body
            && today.upper_shadow() <= body;

        let matched = (declining && shaped).then(|| {
            let confidence = (today.lower_shadow() / (multiple * body * 2.0)).min(1.0);
            (confidence, Direction::Bullish)
        });
        Ok(detection(matched))
    }
}

/// Today's body fully covers yesterday's opposite-colour body.
pub struct Engulfing {
    metadata: CalculatorMetadata,
}

impl Engulfing {
    pub fn new(priority: PriorityTier) -> Self {
        let metadata = CalculatorMetadata::new("engulfing", Category::Candlestick, 2, priority)
            .with_description("bullish or bearish engulfing");
        Self { metadata }
    }
}

impl Calculator<PriceBar> for Engulfing {
    fn metadata(&self) -> &CalculatorMetadata {
        &self.metadata
    }

    fn calculate(
        &self,
        series: &TimeSeries<PriceBar>,
        _params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>> {
        let candles = latest(series, 2)?;
        let (prev, today) = (&candles[0], &candles[1]);

        let covers = today.open.max(today.close) >= prev.open.max(prev.close)
            && today.open.min(today.close) <= prev.open.min(prev.close)
            && today.body() > prev.body();

        let direction = if prev.is_bearish() && today.is_bullish() {
            Some(Direction::Bullish)
        } else if prev.is_bullish() && today.is_bearish() {
            Some(Direction::Bearish)
        } else {
            None
        };

        let matched = direction.filter(|_| covers).map(|d| {
            let confidence = if today.body() > 0.0 {
                1.0 - prev.body() / today.body()
            } else {
                0.0
            };
            (confidence, d)
        });
        Ok(detection(matched))
    }
}
