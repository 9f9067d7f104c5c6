use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bank_etl::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use bank_etl::config::{delimiter_byte, TransformConfig};
use bank_etl::{CsvDirectoryReader, CsvSink, TransformPipeline};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "BANK_ETL_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about = "Bank ETL transform: clean, reconcile and enrich bank extracts", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transform the source tables of one directory into treated outputs
    Run(RunArgs),
    /// List snapshots stored in a checkpoint database
    Checkpoints(CheckpointArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory holding agencias.csv, clientes.csv, transacoes.csv, ...
    #[arg(long)]
    input: PathBuf,
    /// Directory the treated tables are published to
    #[arg(long)]
    output: PathBuf,
    /// TOML configuration (falls back to $BANK_ETL_CONFIG, then defaults)
    #[arg(long)]
    config: Option<PathBuf>,
    /// SQLite file for stage snapshots
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Reference date for ages and birth-date checks (YYYY-MM-DD)
    #[arg(long)]
    processing_date: Option<NaiveDate>,
}

#[derive(Args, Debug)]
struct CheckpointArgs {
    /// SQLite checkpoint file
    #[arg(long)]
    checkpoint: PathBuf,
    /// Only list snapshots of this run
    #[arg(long)]
    run: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Checkpoints(args) => handle_checkpoints(args),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bank_etl=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<TransformConfig> {
    let path = path.or_else(|| env::var(CONFIG_ENV).ok().map(PathBuf::from));
    match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            TransformConfig::load(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))
        }
        None => Ok(TransformConfig::default()),
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config)?;
    if args.processing_date.is_some() {
        config.processing_date = args.processing_date;
    }

    let reader = CsvDirectoryReader::new(&args.input, delimiter_byte(config.source.delimiter)?);
    let sink = CsvSink::new(&args.output, config.sink.clone())?;

    let mut store = match &args.checkpoint {
        Some(path) => Some(
            SqliteCheckpointStore::open(path)
                .with_context(|| format!("Failed to open checkpoint store {}", path.display()))?,
        ),
        None => None,
    };

    let mut pipeline = TransformPipeline::new(&config);
    if let Some(store) = store.as_mut() {
        pipeline = pipeline.with_checkpoints(store);
    }

    let (output, paths) = pipeline
        .run_and_publish(&reader, &sink)
        .with_context(|| format!("Transform of {} failed", args.input.display()))?;

    println!("🏦 Bank ETL run {}", output.run_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ {}", output.report.summary());
    println!("✓ {}", output.quality.summary());
    for (reason, count) in &output.report.rejected_by_reason {
        println!("  ✗ {:<24} {}", reason, count);
    }
    println!("\n📂 Published {} files to {}", paths.len(), sink.dir().display());
    for path in &paths {
        println!("  {}", path.display());
    }

    Ok(())
}

fn handle_checkpoints(args: CheckpointArgs) -> Result<()> {
    let store = SqliteCheckpointStore::open(&args.checkpoint)
        .with_context(|| format!("Failed to open checkpoint store {}", args.checkpoint.display()))?;
    let entries = store.list(args.run.as_deref())?;

    if entries.is_empty() {
        println!("No checkpoints found");
        return Ok(());
    }

    println!(
        "{:<38} {:<11} {:<30} {:>8}  {}",
        "run", "stage", "table", "rows", "created"
    );
    for entry in entries {
        println!(
            "{:<38} {:<11} {:<30} {:>8}  {}",
            entry.run_id,
            entry.stage,
            entry.table,
            entry.row_count,
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}
