use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::PriceBar;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityFinding {
    /// The market traded on `date` but the stock has no bar.
    MissingData { date: NaiveDate },
    /// A stored bar is internally inconsistent.
    ValueMismatch {
        date: NaiveDate,
        field: String,
        detail: String,
    },
}

impl QualityFinding {
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::MissingData { date } | Self::ValueMismatch { date, .. } => *date,
        }
    }

    fn mismatch(date: NaiveDate, field: &str, detail: String) -> Self {
        Self::ValueMismatch {
            date,
            field: field.to_string(),
            detail,
        }
    }
}

impl fmt::Display for QualityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingData { date } => write!(f, "{date}: missing data"),
            Self::ValueMismatch {
                date,
                field,
                detail,
            } => write!(f, "{date}: {field} {detail}"),
        }
    }
}

/// Compare a stock's bars against the market's trading dates and check each
/// bar's internal consistency. Findings are ordered by date.
pub fn scan(bars: &[PriceBar], trading_dates: &[NaiveDate]) -> Vec<QualityFinding> {
    let by_date: BTreeMap<NaiveDate, &PriceBar> = bars.iter().map(|b| (b.date, b)).collect();

    let mut findings: Vec<QualityFinding> = trading_dates
        .iter()
        .filter(|d| !by_date.contains_key(d))
        .map(|&date| QualityFinding::MissingData { date })
        .collect();
    findings.extend(bars.iter().flat_map(check_bar));
    findings.sort_by_key(QualityFinding::date);
    findings
}

fn check_bar(bar: &PriceBar) -> Vec<QualityFinding> {
    let fields = [
        ("open", bar.open),
        ("high", bar.high),
        ("low", bar.low),
        ("close", bar.close),
        ("volume", bar.volume),
    ];
    let non_finite: Vec<QualityFinding> = fields
        .iter()
        .filter(|(_, v)| !v.is_finite())
        .map(|(field, v)| QualityFinding::mismatch(bar.date, field, format!("is not finite ({v})")))
        .collect();
    if !non_finite.is_empty() {
        return non_finite;
    }

    let mut findings = Vec::new();
    if bar.high < bar.low {
        findings.push(QualityFinding::mismatch(
            bar.date,
            "high",
            format!("{} is below low {}", bar.high, bar.low),
        ));
    } else {
        for (field, value) in [("open", bar.open), ("close", bar.close)] {
            if value < bar.low || value > bar.high {
                findings.push(QualityFinding::mismatch(
                    bar.date,
                    field,
                    format!("{value} outside [{}, {}]", bar.low, bar.high),
                ));
            }
        }
    }
    if bar.volume < 0.0 {
        findings.push(QualityFinding::mismatch(
            bar.date,
            "volume",
            format!("{} is negative", bar.volume),
        ));
    }
    findings
}
