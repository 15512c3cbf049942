//! Receipt ingestion CLI
//!
//! Run with: cargo run -p receipt-ingest --features cli -- run receipts/*.jpg

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use receipt_ingest::processing::BatchScheduler;
use receipt_ingest::providers::local::{LocalUploader, LocalValidator, PassthroughOptimizer, StatusHub};
use receipt_ingest::providers::ollama::OllamaExtractor;
use receipt_ingest::providers::Collaborators;
use receipt_ingest::{
    BatchSummary, FileRef, IngestConfig, RateLimiter, ReceiptDb, RiskLevel,
    SchedulerEvent, SessionRecorder,
};

#[derive(Parser)]
#[command(name = "receipt-ingest", version, about = "Batch ingestion of receipt images")]
struct Cli {
    /// TOML configuration file (defaults to $RECEIPT_INGEST_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path override
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a batch of receipt files
    Run {
        /// Receipt files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Risk level applied to every file
        #[arg(short, long, default_value = "medium")]
        risk: RiskLevel,

        /// Maximum jobs in flight
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Retry eligible failures until the batch settles
        #[arg(long)]
        retry_failed: bool,
    },
    /// Show recent batch sessions
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receipt_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IngestConfig::from_env_or_default()?,
    };
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }

    let db = ReceiptDb::new(&config.storage.database_path)
        .with_context(|| format!("opening {}", config.storage.database_path.display()))?;

    match cli.command {
        Command::Run {
            files,
            risk,
            max_concurrent,
            retry_failed,
        } => {
            if let Some(max) = max_concurrent {
                config.scheduler.max_concurrent = max;
            }
            config.validate()?;
            run(config, db, files, risk, retry_failed).await
        }
        Command::History { limit } => {
            let recorder = SessionRecorder::new(Arc::new(db));
            let sessions = recorder.recent(limit).await?;
            if sessions.is_empty() {
                println!("No sessions recorded yet");
            }
            for summary in &sessions {
                print_summary(summary);
            }
            Ok(())
        }
    }
}

async fn run(
    config: IngestConfig,
    db: ReceiptDb,
    paths: Vec<PathBuf>,
    risk: RiskLevel,
    retry_failed: bool,
) -> anyhow::Result<()> {
    tracing::info!("Configuration loaded");
    tracing::info!("  - Max concurrent: {}", config.scheduler.max_concurrent);
    tracing::info!("  - Extraction model: {}", config.pipeline.model_hint);
    tracing::info!("  - Database: {}", config.storage.database_path.display());

    let extractor = OllamaExtractor::new(config.ollama.clone(), db.clone())?;
    if !extractor.health_check().await {
        tracing::warn!("Ollama not available at {}", config.ollama.base_url);
        tracing::warn!("  Start it with: ollama serve && ollama pull {}", config.pipeline.model_hint);
    }

    let collaborators = Collaborators {
        validator: Arc::new(LocalValidator::new(config.validation.clone())),
        optimizer: Arc::new(PassthroughOptimizer),
        uploader: Arc::new(LocalUploader::new(&config.storage.upload_dir)),
        record_store: Arc::new(db.clone()),
        extractor: Arc::new(extractor),
        status_push: Arc::new(StatusHub::default()),
    };
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()).with_backend(Arc::new(db.clone())));
    let recorder = SessionRecorder::new(Arc::new(db));
    let scheduler = BatchScheduler::spawn(&config, collaborators, limiter, Some(recorder));

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        match tokio::fs::read(path).await {
            Ok(data) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let mut file = FileRef::new(filename, data);
                file.content_type = mime_guess::from_path(path).first().map(|m| m.to_string());
                files.push(file);
            }
            Err(e) => eprintln!("{} {}: {}", style("skipped").yellow(), path.display(), e),
        }
    }

    let hints = vec![risk; files.len()];
    let report = scheduler.enqueue(files, &hints).await?;
    for rejected in &report.rejected {
        eprintln!("{} {}: {}", style("rejected").red(), rejected.filename, rejected.reason);
    }
    if report.job_ids.is_empty() {
        println!("Nothing to ingest");
        return Ok(());
    }

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("=> "),
    );

    let mut metrics_rx = scheduler.subscribe_metrics();
    let progress_bar = bar.clone();
    let progress = tokio::spawn(async move {
        while metrics_rx.changed().await.is_ok() {
            let metrics = metrics_rx.borrow_and_update().clone();
            progress_bar.set_position(metrics.percent.round() as u64);
            progress_bar.set_message(format!(
                "{}/{} done, {} failed, {:.1}/min, eta {}",
                metrics.completed,
                metrics.total_files,
                metrics.failed,
                metrics.throughput_per_minute,
                metrics.eta_display()
            ));
        }
    });

    let mut events = scheduler.subscribe_events();
    scheduler.start().await?;

    let summary = loop {
        match events.recv().await {
            Ok(SchedulerEvent::JobFailed { job_id, kind, error, .. }) => {
                bar.println(format!("{} {} ({}): {}", style("failed").red(), job_id, kind, error));
                if retry_failed && kind.is_retry_eligible() {
                    match scheduler.retry(job_id).await {
                        Ok(new_id) => bar.println(format!("{} {} as {}", style("retrying").yellow(), job_id, new_id)),
                        Err(e) => bar.println(format!("{} {}: {}", style("not retried").yellow(), job_id, e)),
                    }
                }
            }
            Ok(SchedulerEvent::Alert(alert)) => {
                bar.println(format!("{} {}", style("alert").yellow().bold(), alert));
            }
            Ok(SchedulerEvent::BatchCompleted(summary)) => {
                // Retries admitted after the run settled need a new run
                if retry_failed && !scheduler.snapshot().pending_ids().is_empty() {
                    bar.println(format!(
                        "{} run {}: {} ok, {} failed",
                        style("finished").dim(),
                        summary.batch_id,
                        summary.succeeded,
                        summary.failed
                    ));
                    scheduler.start().await?;
                    continue;
                }
                break summary;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event stream lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => {
                anyhow::bail!("scheduler stopped before the batch completed");
            }
        }
    };

    progress.abort();
    bar.finish_with_message("done");
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    let status = if summary.failed == 0 {
        style("ok").green().bold()
    } else {
        style("with failures").red().bold()
    };
    println!(
        "\nBatch {} {} ({})",
        style(summary.batch_id).cyan(),
        status,
        summary.completed_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Files:      {}", summary.total_files);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Failed:     {}", summary.failed);
    for (kind, count) in &summary.failures_by_kind {
        println!("    {:<24} {}", kind, count);
    }
    println!("  Duration:   {:.1}s", summary.duration_ms as f64 / 1000.0);
    println!("  API calls:  {}", summary.api_calls_total);
    println!("  Tokens:     {}", summary.tokens_used);
    println!("  Cost:       ${:.4}", summary.estimated_cost);
    println!("  Error rate: {:.1}%", summary.error_rate * 100.0);
}
