pub mod candlestick;
pub mod chart;

use std::sync::Arc;

use error_stack::{Report, bail};

use crate::calculator::{CalcValue, CalcValues, Calculator, values};
use crate::error::CalculationError;
use crate::model::{PriceBar, PriorityTier};

/// The built-in pattern detectors. Quick detection runs only the
/// candlestick category.
pub fn defaults() -> Vec<Arc<dyn Calculator<PriceBar>>> {
    vec![
        Arc::new(candlestick::Doji::new(PriorityTier::P1)),
        Arc::new(candlestick::Hammer::new(PriorityTier::P1)),
        Arc::new(candlestick::Engulfing::new(PriorityTier::P0)),
        Arc::new(chart::Breakout::new(PriorityTier::P0)),
        Arc::new(chart::DoubleBottom::new(PriorityTier::P2)),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }
}

/// Output shape shared by every detector: `detected`, plus `confidence`
/// (0..=1) and `direction` when a pattern matched.
pub fn detection(matched: Option<(f64, Direction)>) -> CalcValues {
    match matched {
        Some((confidence, direction)) => values([
            ("detected", CalcValue::Flag(true)),
            ("confidence", CalcValue::Number(confidence.clamp(0.0, 1.0))),
            ("direction", CalcValue::from(direction.as_str())),
        ]),
        None => values([("detected", CalcValue::Flag(false))]),
    }
}

/// Candle geometry of one bar.
pub(crate) struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn of(bar: &PriceBar) -> Result<Self, Report<CalculationError>> {
        let all_finite = [bar.open, bar.high, bar.low, bar.close]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite || bar.high < bar.low {
            bail!(CalculationError::InvalidInput {
                reason: format!("inconsistent OHLC at {}", bar.date),
            });
        }
        Ok(Self {
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
        })
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn upper_shadow(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_shadow(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}
