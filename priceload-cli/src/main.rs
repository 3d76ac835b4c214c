//! priceload CLI: full-history build, daily update and range load.
//!
//! Commands:
//! - `full`: checkpointed multi-batch build, merged Parquet output, optional upsert
//! - `daily`: upsert the most recent trading day
//! - `range`: upsert an inclusive date window (or dry-run it)
//!
//! Store credentials come from `SUPABASE_URL` and `SUPABASE_KEY`.
//!
//! No cancel flag is installed: Ctrl-C ends the process mid-batch. Checkpoint
//! writes are atomic, so a `full` rerun resumes at the interrupted batch.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use priceload_core::data::{DateWindow, PostgrestClient, UniverseRequest, YahooProvider};
use priceload_core::pipeline::{FullHistoryPipeline, IncrementalUpdater, RunSummary, UpdateReport};
use priceload_core::IngestConfig;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "priceload", about = "priceload: daily equity price ingestion")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Universe and config options shared by every command.
#[derive(Args)]
struct CommonArgs {
    /// Restrict to tickers flagged as tracked.
    #[arg(long, default_value_t = false)]
    tracked: bool,

    /// Comma-separated symbol allow-list (overrides --tracked).
    #[arg(long)]
    symbols: Option<String>,

    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the full history batch by batch with resumable checkpoints.
    Full {
        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Write the merged Parquet file only; skip the store upsert.
        #[arg(long, default_value_t = false)]
        no_upsert: bool,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Upsert the most recent trading day for the universe.
    Daily {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Upsert an inclusive date window for the universe.
    Range {
        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD).
        #[arg(long)]
        end: String,

        /// Fetch and report row counts without writing.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Full {
            start,
            end,
            no_upsert,
            common,
        } => run_full(&start, end.as_deref(), no_upsert, &common),
        Commands::Daily { common } => run_daily(&common),
        Commands::Range {
            start,
            end,
            dry_run,
            common,
        } => run_range(&start, &end, dry_run, &common),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}': expected YYYY-MM-DD"))
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn load_config(path: Option<&PathBuf>) -> Result<IngestConfig> {
    match path {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(IngestConfig::default()),
    }
}

fn universe_request(common: &CommonArgs, config: &IngestConfig) -> UniverseRequest {
    match &common.symbols {
        Some(csv) => UniverseRequest::from_csv(csv),
        None if common.tracked || config.universe.tracked_only => UniverseRequest::tracked(),
        None => UniverseRequest::all(),
    }
}

fn postgrest_client(config: &IngestConfig) -> Result<PostgrestClient> {
    let url = std::env::var("SUPABASE_URL").context("SUPABASE_URL is not set")?;
    let key = std::env::var("SUPABASE_KEY").context("SUPABASE_KEY is not set")?;
    if url.trim().is_empty() || key.trim().is_empty() {
        bail!("SUPABASE_URL and SUPABASE_KEY must be non-empty");
    }
    Ok(PostgrestClient::new(&url, &key, &config.store)?)
}

fn run_full(start: &str, end: Option<&str>, no_upsert: bool, common: &CommonArgs) -> Result<()> {
    let config = load_config(common.config.as_ref())?;
    let start = parse_date(start)?;
    let end = end.map(parse_date).transpose()?.unwrap_or_else(today);
    let window = DateWindow::new(start, end)?;
    let request = universe_request(common, &config);

    let postgrest = postgrest_client(&config)?;
    let yahoo = YahooProvider::new()?;

    let mut pipeline = FullHistoryPipeline::new(&postgrest, &yahoo, &config);
    if !no_upsert {
        pipeline = pipeline.with_store(&postgrest);
    }
    let summary = pipeline.run(&request, window)?;
    print_run_summary(&summary, &config);
    Ok(())
}

fn run_daily(common: &CommonArgs) -> Result<()> {
    let config = load_config(common.config.as_ref())?;
    let request = universe_request(common, &config);

    let postgrest = postgrest_client(&config)?;
    let yahoo = YahooProvider::new()?;

    let report = IncrementalUpdater::new(&postgrest, &yahoo, &postgrest, &config).run_daily(&request, today())?;
    print_update_report(&report);
    Ok(())
}

fn run_range(start: &str, end: &str, dry_run: bool, common: &CommonArgs) -> Result<()> {
    let config = load_config(common.config.as_ref())?;
    let window = DateWindow::new(parse_date(start)?, parse_date(end)?)?;
    let request = universe_request(common, &config);

    let postgrest = postgrest_client(&config)?;
    let yahoo = YahooProvider::new()?;

    let report = IncrementalUpdater::new(&postgrest, &yahoo, &postgrest, &config)
        .run_range(&request, window, dry_run)?;
    print_update_report(&report);
    Ok(())
}

fn print_run_summary(summary: &RunSummary, config: &IngestConfig) {
    if summary.cancelled {
        println!("Cancelled before stitching; rerun to resume from the checkpoints.");
        return;
    }
    println!(
        "Batches: {} total, {} skipped, {} bulk, {} salvaged, {} failed",
        summary.batches_total,
        summary.batches_skipped,
        summary.batches_bulk,
        summary.batches_salvaged,
        summary.batches_failed
    );
    println!(
        "Wrote {} rows for {} symbols to {}",
        summary.rows_stitched,
        summary.symbols,
        config.paths.output.display()
    );
    if let Some(rows) = summary.rows_upserted {
        println!("Upserted {rows} rows into {}", config.store.price_table);
    }
    if !summary.unavailable.is_empty() {
        println!(
            "{} symbols unavailable; see {}",
            summary.unavailable.len(),
            config.paths.failures.display()
        );
    }
}

fn print_update_report(report: &UpdateReport) {
    if report.cancelled {
        println!("Cancelled; nothing written.");
        return;
    }
    let verb = if report.dry_run { "Prepared (dry run)" } else { "Upserted" };
    let rows = if report.dry_run {
        report.rows_prepared
    } else {
        report.rows_upserted
    };
    println!(
        "{verb} {rows} rows for {} → {} across {} symbols",
        report.window.start(),
        report.window.end(),
        report.symbols
    );
    if !report.unavailable.is_empty() {
        println!("{} symbols returned no data", report.unavailable.len());
    }
}
