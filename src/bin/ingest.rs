//! One-shot batch ingestion: scan the archive, push everything through the
//! pipeline, wait for the queue to drain, report.

use anyhow::Result;
use clap::Parser;
use paperflow::db::{migrate, Db};
use paperflow::extract::OllamaExtractor;
use paperflow::scan::{self, compute_fingerprint};
use paperflow::scheduler::{IngestionScheduler, SubmitMode, SubmitOutcome};
use paperflow::{store, Config};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Ingest archive PDFs into the paperflow database (incremental by default)")]
struct Args {
    /// Force re-processing of all files (ignore stored fingerprints)
    #[arg(short, long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    log::info!("Starting paperflow batch ingestion");

    let config = Config::load()?;
    log::info!("Archive root: {}", config.archive_root().display());
    log::info!("Database path: {}", config.db_path().display());

    let db = Db::new(config.db_path());
    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    let files = scan::discover_pdfs(config.archive_root())?;
    if files.is_empty() {
        log::warn!("No PDFs found. Check archive.root in config.toml.");
        return Ok(());
    }

    let extractor = Arc::new(OllamaExtractor::new(&config.extraction));
    let scheduler = IngestionScheduler::start(
        db.clone(),
        extractor,
        config.pipeline.clone(),
    );

    if args.force {
        log::info!("Mode: full re-processing (all {} files)", files.len());
        for file in &files {
            let fingerprint = compute_fingerprint(&file.absolute_path)?;
            if let Some(row) = store::find_by_fingerprint(&db, &fingerprint).await? {
                store::reset_for_reprocessing(&db, &row.id, &fingerprint).await?;
            }
        }
    }

    let start = Instant::now();
    let mut enqueued = 0usize;
    let mut skipped = 0usize;
    let mut awaiting_retry = 0usize;

    for (idx, file) in files.iter().enumerate() {
        log::info!("[{}/{}] Submitting: {}", idx + 1, files.len(), file.relative_path);
        match scheduler.submit(file, SubmitMode::Block).await? {
            SubmitOutcome::Enqueued => enqueued += 1,
            SubmitOutcome::AlreadyProcessed | SubmitOutcome::AlreadyInFlight => skipped += 1,
            SubmitOutcome::FailedAwaitingRetry => {
                awaiting_retry += 1;
                log::warn!("{}: failed previously, use the retry endpoint to reprocess", file.relative_path);
            }
            other => log::warn!("{}: unexpected outcome {:?}", file.relative_path, other),
        }
    }

    // Drain: the queue is bounded and submissions block, so once nothing is
    // in flight the batch is done.
    while scheduler.in_flight_count() > 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    scheduler.shutdown();
    scheduler.join().await;

    let counts = store::status_counts(&db).await?;
    let elapsed = start.elapsed();

    log::info!("=== Ingestion Complete ===");
    log::info!("Files discovered: {}", files.len());
    log::info!("  Enqueued: {}", enqueued);
    log::info!("  Skipped (unchanged): {}", skipped);
    log::info!("  Failed earlier, awaiting manual retry: {}", awaiting_retry);
    log::info!("Archive totals: {} papers ({} processed, {} pending, {} failed)",
        counts.total, counts.processed, counts.pending, counts.failed);
    log::info!("Time: {:?}", elapsed);

    if counts.failed > 0 {
        log::warn!("Some papers failed to process. Check logs above for details.");
    }

    Ok(())
}
