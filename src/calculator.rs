use std::collections::BTreeMap;
use std::fmt;

use error_stack::{Report, bail};
use serde::{Deserialize, Serialize};

use crate::error::CalculationError;
use crate::model::{Category, Observation, PriorityTier, TimeSeries};

/// A single named output of a calculator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CalcValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl CalcValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Non-numeric values are always finite.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for CalcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n:.4}"),
            Self::Flag(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for CalcValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for CalcValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<&str> for CalcValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Named outputs of one calculation, ordered by key.
pub type CalcValues = BTreeMap<String, CalcValue>;

/// Build a [`CalcValues`] map from `(key, value)` pairs.
pub fn values<const N: usize>(pairs: [(&str, CalcValue); N]) -> CalcValues {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Numeric calculator parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalcParams(BTreeMap<String, f64>);

impl CalcParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: &[(&str, f64)]) -> Self {
        Self(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).unwrap_or(default)
    }

    /// A positive whole-number parameter such as a period or window length.
    pub fn period(&self, key: &str, default: usize) -> Result<usize, Report<CalculationError>> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        if !raw.is_finite() || raw < 1.0 || raw.fract() != 0.0 {
            bail!(CalculationError::InvalidParameter {
                name: format!("{key} must be a positive integer, got {raw}"),
            });
        }
        Ok(raw as usize)
    }

    /// Period lookup for sizing decisions, where an invalid value falls back
    /// to `default` and is reported later by `calculate`.
    pub fn period_or(&self, key: &str, default: usize) -> usize {
        self.period(key, default).unwrap_or(default)
    }

    /// Return `self` with every key of `overrides` replacing its counterpart.
    pub fn merged(&self, overrides: &CalcParams) -> CalcParams {
        let mut merged = self.0.clone();
        merged.extend(overrides.0.iter().map(|(k, v)| (k.clone(), *v)));
        Self(merged)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CalcParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(", "))
    }
}

/// Static description of a calculator.
#[derive(Debug, Clone)]
pub struct CalculatorMetadata {
    pub name: String,
    pub category: Category,
    /// Minimum observations (trading days for chip records) before the
    /// calculator may run. Always at least 1.
    pub min_data_points: usize,
    pub priority: PriorityTier,
    pub default_params: CalcParams,
    pub description: String,
}

impl CalculatorMetadata {
    pub fn new(
        name: impl Into<String>,
        category: Category,
        min_data_points: usize,
        priority: PriorityTier,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            min_data_points,
            priority,
            default_params: CalcParams::new(),
            description: String::new(),
        }
    }

    pub fn with_params(mut self, params: CalcParams) -> Self {
        self.default_params = params;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Default data-sufficiency policy: the series holds at least `required`
/// observations.
pub fn default_sufficiency<O: Observation>(required: usize, series: &TimeSeries<O>) -> bool {
    series.len() >= required
}

/// A stateless metric computation over one stock's series.
///
/// Implementations must be deterministic in `(series, params)` and must not
/// hold run-scoped mutable state, so one instance can serve every worker.
pub trait Calculator<O: Observation>: Send + Sync {
    fn metadata(&self) -> &CalculatorMetadata;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn category(&self) -> Category {
        self.metadata().category
    }

    /// Observations needed under `params`. Never below `min_data_points`.
    fn required_points(&self, _params: &CalcParams) -> usize {
        self.metadata().min_data_points
    }

    /// Checked by the orchestrator before every `calculate` call.
    fn has_enough_data(&self, series: &TimeSeries<O>, params: &CalcParams) -> bool {
        default_sufficiency(self.required_points(params), series)
    }

    /// Compute named outputs for the latest observation of `series`.
    ///
    /// Input the calculator cannot interpret is an error, never a silent
    /// zero.
    fn calculate(
        &self,
        series: &TimeSeries<O>,
        params: &CalcParams,
    ) -> Result<CalcValues, Report<CalculationError>>;
}
