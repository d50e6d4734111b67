use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Args;
use error_stack::{Report, ResultExt, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::AppError;
use crate::config::ScheduleConfig;
use crate::engine::detection::{DetectionMode, DetectionPlan, Detector};
use crate::import;
use crate::model::{Family, PriorityTier};
use crate::quality;
use crate::registry::{Registered, Registries};
use crate::scheduler::{self, FamilyOutcome, ManualRun, Triggers};
use crate::storage::TradingCalendar;
use crate::storage::sqlite::SqliteStorage;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Calculation date (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    pub date: Option<NaiveDate>,
    /// Run only this tier (P0, P1, P2). Omit to run every tier.
    #[arg(long)]
    pub priority: Option<PriorityTier>,
    /// Include every tier more urgent than `--priority`.
    #[arg(long, requires = "priority")]
    pub at_or_above: bool,
    /// Recompute pairs that already have stored results.
    #[arg(long)]
    pub force: bool,
    /// Families to run; repeatable. Defaults to all.
    #[arg(long = "family")]
    pub families: Vec<Family>,
    #[arg(long = "stock")]
    pub stocks: Vec<String>,
    #[arg(long = "calculator")]
    pub calculators: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    #[arg(long)]
    pub from: NaiveDate,
    #[arg(long)]
    pub to: NaiveDate,
    #[arg(long)]
    pub stock: Option<String>,
    /// Candlestick patterns only.
    #[arg(long)]
    pub quick: bool,
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    pub stock: String,
    #[arg(long)]
    pub date: NaiveDate,
    #[arg(long)]
    pub calculator: Option<String>,
}

#[derive(Debug, Args)]
pub struct QualityArgs {
    #[arg(long)]
    pub stock: String,
    #[arg(long)]
    pub from: NaiveDate,
    #[arg(long)]
    pub to: NaiveDate,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// CSV file with a header row.
    pub path: PathBuf,
}

pub async fn serve(
    triggers: Triggers,
    schedules: &[ScheduleConfig],
    cancel: CancellationToken,
) -> Result<(), Report<AppError>> {
    if schedules.is_empty() {
        warn!("no schedules configured; nothing to do");
        return Ok(());
    }

    let tracker = triggers.tracker().clone();
    let mut sched = scheduler::start(triggers, schedules)
        .await
        .change_context(AppError::Scheduler)?;
    info!(schedules = schedules.len(), "scheduler running, press ctrl+c to stop");

    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    cancel.cancel();
    if let Err(e) = sched.shutdown().await {
        warn!(error = ?e, "scheduler shutdown failed");
    }

    tracker.close();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("running jobs did not finish within the grace period");
    }

    info!("shutdown complete");
    Ok(())
}

pub async fn run(triggers: &Triggers, args: RunArgs) -> Result<(), Report<AppError>> {
    let request = ManualRun {
        date: args.date.unwrap_or_else(|| triggers.today()),
        tier: args.priority,
        at_or_above: args.at_or_above,
        families: if args.families.is_empty() {
            Family::ALL.to_vec()
        } else {
            args.families
        },
        force: args.force,
        stock_ids: args.stocks,
        calculators: args.calculators,
    };

    let outcomes = triggers.run_manually(&request).await;
    print_outcomes(&outcomes);

    if outcomes.iter().any(|(_, result)| result.is_err()) {
        bail!(AppError::Engine);
    }
    Ok(())
}

fn print_outcomes(outcomes: &[FamilyOutcome]) {
    for (family, result) in outcomes {
        match result {
            Ok(outcome) => {
                let cancelled = if outcome.cancelled { " (cancelled)" } else { "" };
                println!("[{family}] {} {}{cancelled}", outcome.date, outcome.summary);
                for (stock_id, calculator, pair) in outcome.pairs() {
                    if let Some(cause) = pair.failure() {
                        println!("  {stock_id} {calculator}: {} {cause}", pair.label());
                    }
                }
            }
            Err(report) => {
                println!("[{family}] run failed: {}", report.current_context());
            }
        }
    }
}

pub async fn detect(
    triggers: &Triggers,
    storage: Arc<SqliteStorage>,
    args: DetectArgs,
    cancel: &CancellationToken,
) -> Result<(), Report<AppError>> {
    let detector = Detector::new(
        Arc::clone(&triggers.engines().pattern),
        storage.clone(),
        storage,
    );
    let plan = DetectionPlan {
        from: args.from,
        to: args.to,
        stock_id: args.stock,
        mode: if args.quick {
            DetectionMode::Quick
        } else {
            DetectionMode::Full
        },
        force: args.force,
    };

    let result = detector
        .detect(&plan, cancel)
        .await
        .change_context(AppError::Engine)?;

    for m in &result.matches {
        println!(
            "{} {:<8} {:<16} {:<8} confidence={:.2}",
            m.date, m.stock_id, m.pattern, m.direction, m.confidence
        );
    }
    println!(
        "{} matches over {} trading dates ({})",
        result.matches.len(),
        result.dates,
        result.summary
    );
    Ok(())
}

pub async fn import_prices(
    storage: &SqliteStorage,
    args: ImportArgs,
) -> Result<(), Report<AppError>> {
    let summary = import::import_prices(storage, &args.path)
        .await
        .change_context(AppError::Import)?;
    println!("imported {summary}");
    Ok(())
}

pub async fn import_chips(
    storage: &SqliteStorage,
    args: ImportArgs,
) -> Result<(), Report<AppError>> {
    let summary = import::import_chips(storage, &args.path)
        .await
        .change_context(AppError::Import)?;
    println!("imported {summary}");
    Ok(())
}

pub async fn show(storage: &SqliteStorage, args: ShowArgs) -> Result<(), Report<AppError>> {
    let results = storage
        .list_results(args.date, Some(args.stock.as_str()), args.calculator.as_deref())
        .await
        .change_context(AppError::Storage)?;

    if results.is_empty() {
        println!("no stored results for {} on {}", args.stock, args.date);
        return Ok(());
    }
    for stored in results {
        let values: Vec<String> = stored
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!("{:<28} {}", stored.calculator, values.join(" "));
    }
    Ok(())
}

pub async fn quality(storage: &SqliteStorage, args: QualityArgs) -> Result<(), Report<AppError>> {
    if args.from > args.to {
        bail!(AppError::Usage);
    }
    let bars = storage
        .price_bars_in_range(&args.stock, args.from, args.to)
        .await
        .change_context(AppError::Storage)?;
    let trading_dates = storage
        .trading_dates(args.from, args.to)
        .await
        .change_context(AppError::Storage)?;

    let findings = quality::scan(&bars, &trading_dates);
    for finding in &findings {
        println!("{} {finding}", args.stock);
    }
    println!(
        "{} findings across {} trading dates ({} bars)",
        findings.len(),
        trading_dates.len(),
        bars.len()
    );
    Ok(())
}

pub fn calculators(registries: &Registries) {
    println!(
        "{:<28} {:<10} {:<20} {:<4} {:>5}  params / description",
        "name", "family", "category", "tier", "min"
    );
    print_registry(Family::Technical, registries.technical.all());
    print_registry(Family::Chip, registries.chip.all());
    print_registry(Family::Pattern, registries.pattern.all());
}

fn print_registry<O: crate::model::Observation>(family: Family, entries: &[Registered<O>]) {
    for entry in entries {
        let metadata = entry.calculator.metadata();
        println!(
            "{:<28} {:<10} {:<20} {:<4} {:>5}  {}",
            metadata.name,
            family,
            metadata.category,
            metadata.priority,
            metadata.min_data_points,
            entry.params
        );
        if !metadata.description.is_empty() {
            println!("    {}", metadata.description);
        }
    }
}
