mod calculator;
mod chip;
mod commands;
mod config;
mod engine;
mod error;
mod import;
mod indicator;
mod model;
mod pattern;
mod quality;
mod registry;
mod scheduler;
mod storage;

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commands::{DetectArgs, ImportArgs, QualityArgs, RunArgs, ShowArgs};
use config::AppConfig;
use engine::EngineSettings;
use registry::Registries;
use scheduler::{Engines, Triggers};
use storage::sqlite::SqliteStorage;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("calculator registry error")]
    Registry,
    #[display("scheduler error")]
    Scheduler,
    #[display("import error")]
    Import,
    #[display("calculation failed")]
    Engine,
    #[display("invalid arguments")]
    Usage,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "stock-metrics", about = "Daily stock metric calculation engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured tier schedules until ctrl+c.
    Serve,
    /// Calculate metrics for one date.
    Run(RunArgs),
    /// Detect patterns across a date range.
    Detect(DetectArgs),
    /// Load observations from CSV.
    #[command(subcommand)]
    Import(ImportKind),
    /// Print stored results for a stock.
    Show(ShowArgs),
    /// Report gaps and inconsistent bars for a stock.
    Quality(QualityArgs),
    /// List registered calculators with their effective parameters.
    Calculators,
}

#[derive(Subcommand)]
enum ImportKind {
    Prices(ImportArgs),
    Chips(ImportArgs),
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let overrides = config.overrides().change_context(AppError::Config)?;
    let registries = Registries::build(&overrides).change_context(AppError::Registry)?;

    if let Command::Calculators = cli.command {
        commands::calculators(&registries);
        return Ok(());
    }

    // ── Storage ───────────────────────────────────────────────────────────────
    let data_dir = &config.general.data_dir;
    std::fs::create_dir_all(data_dir)
        .change_context(AppError::Storage)
        .attach_with(|| format!("data_dir: {data_dir}"))?;

    let db_path = format!("{data_dir}/stock-metrics.db");
    let storage = Arc::new(
        SqliteStorage::open(Path::new(&db_path))
            .await
            .change_context(AppError::Storage)?,
    );
    info!(db = %db_path, "storage ready");

    // ── Engines ───────────────────────────────────────────────────────────────
    let settings = EngineSettings::from(&config.engine);
    let engines = Arc::new(Engines::build(&registries, storage.clone(), &settings));
    let cancel = CancellationToken::new();
    let triggers = Triggers::new(engines, config.general.utc_offset_hours, cancel.clone())
        .change_context(AppError::Scheduler)?;

    match cli.command {
        Command::Serve => commands::serve(triggers, &config.schedules, cancel).await,
        Command::Run(args) => commands::run(&triggers, args).await,
        Command::Detect(args) => commands::detect(&triggers, storage, args, &cancel).await,
        Command::Import(ImportKind::Prices(args)) => commands::import_prices(&storage, args).await,
        Command::Import(ImportKind::Chips(args)) => commands::import_chips(&storage, args).await,
        Command::Show(args) => commands::show(&storage, args).await,
        Command::Quality(args) => commands::quality(&storage, args).await,
        Command::Calculators => Ok(()),
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
