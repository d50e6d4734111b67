use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use error_stack::{Report, bail};
use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Urgency tier of a calculator. `P0` is the most urgent.
///
/// Ordering follows urgency: `P0 < P1 < P2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    P0,
    P1,
    P2,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 3] = [Self::P0, Self::P1, Self::P2];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
        }
    }

    /// `true` when `self` is as urgent as `other` or more.
    pub fn at_or_above(self, other: PriorityTier) -> bool {
        self <= other
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            _ => Err(format!("unknown priority tier \"{s}\" (expected P0, P1 or P2)")),
        }
    }
}

/// Engine family. Each family has its own registry and orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Technical,
    Chip,
    Pattern,
}

impl Family {
    pub const ALL: [Family; 3] = [Self::Technical, Self::Chip, Self::Pattern];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Chip => "chip",
            Self::Pattern => "pattern",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "technical" => Ok(Self::Technical),
            "chip" => Ok(Self::Chip),
            "pattern" => Ok(Self::Pattern),
            _ => Err(format!(
                "unknown family \"{s}\" (expected technical, chip or pattern)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Trend,
    Momentum,
    Volatility,
    Volume,
    Candlestick,
    ChartPattern,
    InstitutionalFlow,
    Concentration,
    Margin,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trend => "trend",
            Self::Momentum => "momentum",
            Self::Volatility => "volatility",
            Self::Volume => "volume",
            Self::Candlestick => "candlestick",
            Self::ChartPattern => "chart_pattern",
            Self::InstitutionalFlow => "institutional_flow",
            Self::Concentration => "concentration",
            Self::Margin => "margin",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let category = match s {
            "trend" => Self::Trend,
            "momentum" => Self::Momentum,
            "volatility" => Self::Volatility,
            "volume" => Self::Volume,
            "candlestick" => Self::Candlestick,
            "chart_pattern" => Self::ChartPattern,
            "institutional_flow" => Self::InstitutionalFlow,
            "concentration" => Self::Concentration,
            "margin" => Self::Margin,
            _ => return Err(format!("unknown category \"{s}\"")),
        };
        Ok(category)
    }
}

/// A dated observation that can live in a [`TimeSeries`].
pub trait Observation: Clone + Send + Sync + 'static {
    fn date(&self) -> NaiveDate;
}

/// Daily OHLCV bar, consumed by the technical and pattern families.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Observation for PriceBar {
    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// Daily ownership ("chip") record.
///
/// Net flows are in shares. Holder distribution is published weekly and
/// margin data can be missing, so those fields are optional.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipRecord {
    pub date: NaiveDate,
    pub foreign_net: f64,
    pub trust_net: f64,
    pub dealer_net: f64,
    pub major_holder_ratio: Option<f64>,
    pub holder_count: Option<i64>,
    pub margin_balance: Option<f64>,
    pub short_balance: Option<f64>,
}

impl Observation for ChipRecord {
    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// Immutable, strictly date-ascending observations for one stock.
#[derive(Debug, Clone)]
pub struct TimeSeries<O> {
    stock_id: String,
    observations: Vec<O>,
}

impl<O: Observation> TimeSeries<O> {
    /// Build a series, rejecting out-of-order or duplicate dates.
    pub fn new(
        stock_id: impl Into<String>,
        observations: Vec<O>,
    ) -> Result<Self, Report<DataError>> {
        let stock_id = stock_id.into();
        if let Some(w) = observations
            .windows(2)
            .find(|w| w[0].date() >= w[1].date())
        {
            bail!(DataError::Malformed {
                stock_id,
                reason: format!(
                    "dates not strictly increasing ({} then {})",
                    w[0].date(),
                    w[1].date()
                ),
            });
        }
        Ok(Self {
            stock_id,
            observations,
        })
    }

    pub fn stock_id(&self) -> &str {
        &self.stock_id
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[O] {
        &self.observations
    }

    /// The trailing `n` observations, or the whole series when shorter.
    pub fn tail(&self, n: usize) -> &[O] {
        let start = self.observations.len().saturating_sub(n);
        &self.observations[start..]
    }

    pub fn last(&self) -> Option<&O> {
        self.observations.last()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.observations.last().map(Observation::date)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{Days, NaiveDate};

    use super::{ChipRecord, PriceBar, TimeSeries};

    pub fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Consecutive calendar days ending at `end`, one bar per close.
    pub fn bars_ending(end: NaiveDate, closes: &[f64]) -> Vec<PriceBar> {
        let n = closes.len() as u64;
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar {
                date: end - Days::new(n - 1 - i as u64),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1_000.0,
            })
            .collect()
    }

    pub fn series_from_closes(closes: &[f64]) -> TimeSeries<PriceBar> {
        TimeSeries::new("TEST", bars_ending(date("2025-01-02"), closes)).unwrap()
    }

    pub fn series_from_bars(bars: Vec<PriceBar>) -> TimeSeries<PriceBar> {
        TimeSeries::new("TEST", bars).unwrap()
    }

    pub fn bar(date_str: &str, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar {
            date: date(date_str),
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    pub fn chip(day: u32, foreign: f64, trust: f64, dealer: f64) -> ChipRecord {
        ChipRecord {
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            foreign_net: foreign,
            trust_net: trust,
            dealer_net: dealer,
            major_holder_ratio: None,
            holder_count: None,
            margin_balance: None,
            short_balance: None,
        }
    }
}
