use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::ImportError;
use crate::model::{ChipRecord, Observation, PriceBar};
use crate::storage::sqlite::SqliteStorage;

/// `stock_id,date,open,high,low,close,volume`
#[derive(Debug, Deserialize)]
struct PriceRow {
    stock_id: String,
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// `stock_id,date,foreign_net,trust_net,dealer_net` followed by the optional
/// `major_holder_ratio,holder_count,margin_balance,short_balance` columns.
#[derive(Debug, Deserialize)]
struct ChipRow {
    stock_id: String,
    date: NaiveDate,
    foreign_net: f64,
    trust_net: f64,
    dealer_net: f64,
    #[serde(default)]
    major_holder_ratio: Option<f64>,
    #[serde(default)]
    holder_count: Option<i64>,
    #[serde(default)]
    margin_balance: Option<f64>,
    #[serde(default)]
    short_balance: Option<f64>,
}

impl PriceRow {
    fn split(self) -> (String, PriceBar) {
        let bar = PriceBar {
            date: self.date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        };
        (self.stock_id, bar)
    }
}

impl ChipRow {
    fn split(self) -> (String, ChipRecord) {
        let record = ChipRecord {
            date: self.date,
            foreign_net: self.foreign_net,
            trust_net: self.trust_net,
            dealer_net: self.dealer_net,
            major_holder_ratio: self.major_holder_ratio,
            holder_count: self.holder_count,
            margin_balance: self.margin_balance,
            short_balance: self.short_balance,
        };
        (self.stock_id, record)
    }
}

/// Observations grouped by stock, each ascending by date with one entry
/// per date.
#[derive(Debug)]
pub struct Grouped<O> {
    pub by_stock: BTreeMap<String, Vec<O>>,
    pub rows: usize,
    /// Rows replaced by a later row for the same stock and date.
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub stocks: usize,
    pub observations: usize,
    pub duplicates: usize,
}

impl std::fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} observations for {} stocks ({} duplicate rows replaced)",
            self.observations, self.stocks, self.duplicates
        )
    }
}

fn read_rows<T, R>(reader: R, source: &str) -> Result<Vec<T>, Report<ImportError>>
where
    T: DeserializeOwned,
    R: Read,
{
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader)
        .deserialize()
        .map(|row| {
            row.map_err(|e| {
                Report::new(ImportError::Parse {
                    path: source.to_string(),
                    reason: e.to_string(),
                })
            })
        })
        .collect()
}

fn group<O: Observation>(rows: impl IntoIterator<Item = (String, O)>) -> Grouped<O> {
    let mut by_stock: BTreeMap<String, BTreeMap<NaiveDate, O>> = BTreeMap::new();
    let (mut total, mut duplicates) = (0, 0);
    for (stock_id, observation) in rows {
        total += 1;
        if by_stock
            .entry(stock_id)
            .or_default()
            .insert(observation.date(), observation)
            .is_some()
        {
            duplicates += 1;
        }
    }
    Grouped {
        by_stock: by_stock
            .into_iter()
            .map(|(id, dated)| (id, dated.into_values().collect()))
            .collect(),
        rows: total,
        duplicates,
    }
}

pub fn parse_prices<R: Read>(
    reader: R,
    source: &str,
) -> Result<Grouped<PriceBar>, Report<ImportError>> {
    let rows: Vec<PriceRow> = read_rows(reader, source)?;
    Ok(group(rows.into_iter().map(PriceRow::split)))
}

pub fn parse_chips<R: Read>(
    reader: R,
    source: &str,
) -> Result<Grouped<ChipRecord>, Report<ImportError>> {
    let rows: Vec<ChipRow> = read_rows(reader, source)?;
    Ok(group(rows.into_iter().map(ChipRow::split)))
}

fn open(path: &Path) -> Result<File, Report<ImportError>> {
    File::open(path).change_context(ImportError::Read {
        path: path.display().to_string(),
    })
}

fn summarize<O>(grouped: &Grouped<O>) -> ImportSummary {
    ImportSummary {
        stocks: grouped.by_stock.len(),
        observations: grouped.by_stock.values().map(Vec::len).sum(),
        duplicates: grouped.duplicates,
    }
}

/// Upsert daily prices from a CSV file and register their stocks.
pub async fn import_prices(
    storage: &SqliteStorage,
    path: &Path,
) -> Result<ImportSummary, Report<ImportError>> {
    let source = path.display().to_string();
    let grouped = parse_prices(open(path)?, &source)?;

    for (stock_id, bars) in &grouped.by_stock {
        storage
            .upsert_price_bars(stock_id, bars)
            .await
            .change_context(ImportError::Store)?;
    }
    let ids: BTreeSet<String> = grouped.by_stock.keys().cloned().collect();
    storage
        .upsert_stocks(&ids)
        .await
        .change_context(ImportError::Store)?;

    let summary = summarize(&grouped);
    info!(path = %source, rows = grouped.rows, %summary, "price import complete");
    Ok(summary)
}

/// Upsert chip records from a CSV file and register their stocks.
pub async fn import_chips(
    storage: &SqliteStorage,
    path: &Path,
) -> Result<ImportSummary, Report<ImportError>> {
    let source = path.display().to_string();
    let grouped = parse_chips(open(path)?, &source)?;

    for (stock_id, records) in &grouped.by_stock {
        storage
            .upsert_chip_records(stock_id, records)
            .await
            .change_context(ImportError::Store)?;
    }
    let ids: BTreeSet<String> = grouped.by_stock.keys().cloned().collect();
    storage
        .upsert_stocks(&ids)
        .await
        .change_context(ImportError::Store)?;

    let summary = summarize(&grouped);
    info!(path = %source, rows = grouped.rows, %summary, "chip import complete");
    Ok(summary)
}
