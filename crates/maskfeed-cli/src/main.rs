use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maskfeed_sync::{RunSummary, SinkOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "maskfeed")]
#[command(about = "Republishes open-data mask and clinic feeds to storage and spreadsheets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled job once, or just the named one.
    Run {
        #[arg(long)]
        job: Option<String>,
        /// Print run summaries as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run enabled jobs on MASKFEED_SCHEDULER_CRON until interrupted.
    Schedule,
    /// Validate a local CSV file against a built-in schema.
    Validate {
        #[arg(long)]
        schema: String,
        path: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if maskfeed_sync::env_flag(std::env::var(maskfeed_sync::LOG_JSON_VAR).ok()) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_summary(summary: &RunSummary) {
    let sink = match &summary.outcome {
        SinkOutcome::Blob {
            location,
            content_sha256,
            ..
        } => format!("location={location} sha256={content_sha256}"),
        SinkOutcome::Sheet {
            ranges,
            matched_rows,
            updated_cells,
        } => format!("ranges={ranges} matched_rows={matched_rows} cells={updated_cells}"),
    };
    println!(
        "job {} complete: run_id={} rows={} valid={} invalid={} duplicates={} merged={} {sink}",
        summary.job_id,
        summary.run_id,
        summary.rows,
        summary.valid,
        summary.invalid,
        summary.duplicates,
        summary.merged,
    );
}

fn validate_file(schema: &str, path: &Path) -> Result<()> {
    let schema = maskfeed_adapters::schema_by_name(schema)?;
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let feed_id = path.display().to_string();
    let batch = maskfeed_adapters::validate_text(&feed_id, &text, &schema)?;
    println!(
        "{}: schema={} rows={} valid={} invalid={} duplicates={}",
        path.display(),
        schema.name(),
        batch.rows,
        batch.dataset.len(),
        batch.invalid,
        batch.duplicates
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        job: None,
        json: false,
    }) {
        Commands::Run { job, json } => {
            let summaries = maskfeed_sync::run_once_from_env(job.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                summaries.iter().for_each(print_summary);
            }
        }
        Commands::Schedule => maskfeed_sync::schedule_from_env().await?,
        Commands::Validate { schema, path } => validate_file(&schema, &path)?,
    }

    Ok(())
}
