use anyhow::Result;
use paperflow::cache::EmbeddingCache;
use paperflow::db::{migrate, Db};
use paperflow::extract::OllamaExtractor;
use paperflow::http::{self, AppState};
use paperflow::scan;
use paperflow::scheduler::{IngestionScheduler, SubmitMode};
use paperflow::watch;
use paperflow::Config;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "serve" => {
            run_service().await?;
        }
        "verify" | _ => {
            run_schema_verification().await?;
        }
    }

    Ok(())
}

/// Run the full service: scheduler, watcher, periodic rescan, HTTP API.
async fn run_service() -> Result<()> {
    log::info!("Starting paperflow v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    log::info!("Archive root: {}", config.archive_root().display());
    log::info!("Database path: {}", config.db_path().display());

    let db = Db::new(config.db_path());
    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    let extractor: Arc<dyn paperflow::extract::ExtractionClient> =
        Arc::new(OllamaExtractor::new(&config.extraction));
    let scheduler = IngestionScheduler::start(
        db.clone(),
        Arc::clone(&extractor),
        config.pipeline.clone(),
    );

    // Startup scan plus periodic reconciliation: the watcher alone is not
    // the only path to eventual consistency.
    let scan_scheduler = Arc::clone(&scheduler);
    let scan_root = config.archive_root().to_path_buf();
    let rescan_interval = Duration::from_secs(config.archive.rescan_interval_secs);
    tokio::spawn(async move {
        loop {
            match scan::discover_pdfs(&scan_root) {
                Ok(files) => {
                    for file in &files {
                        match scan_scheduler.submit(file, SubmitMode::Block).await {
                            Ok(paperflow::SubmitOutcome::ShuttingDown) => return,
                            Ok(_) => {}
                            Err(e) => {
                                log::error!("scan: submit {} failed: {}", file.relative_path, e)
                            }
                        }
                    }
                }
                Err(e) => log::error!("archive scan failed: {}", e),
            }
            tokio::time::sleep(rescan_interval).await;
        }
    });

    // Live watcher; failures are non-fatal thanks to the rescan loop.
    let watch_scheduler = Arc::clone(&scheduler);
    let watch_root = config.archive_root().to_path_buf();
    let debounce_ms = config.pipeline.debounce_ms;
    tokio::spawn(async move {
        if let Err(e) = watch::run_watcher(watch_scheduler, watch_root, debounce_ms).await {
            log::error!("watcher stopped: {} (relying on periodic rescan)", e);
        }
    });

    if config.http.enabled {
        let state = Arc::new(AppState {
            db: db.clone(),
            scheduler: Arc::clone(&scheduler),
            extractor: Arc::clone(&extractor),
            query_cache: Arc::new(EmbeddingCache::new(config.extraction.query_cache_capacity)),
            config: config.clone(),
        });
        let port = config.http.port;
        tokio::spawn(async move {
            if let Err(e) = http::serve(state, port).await {
                log::error!("HTTP server stopped: {}", e);
            }
        });
    }

    log::info!("Service running (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await?;

    // Let in-flight workers finish their current stage and persist a
    // consistent status before the process exits.
    log::info!("Shutting down; waiting for in-flight work to settle");
    scheduler.shutdown();
    scheduler.join().await;
    log::info!("Shutdown complete");

    Ok(())
}

/// Run database schema verification
async fn run_schema_verification() -> Result<()> {
    log::info!("Starting paperflow v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    log::info!("Configuration loaded successfully");
    log::info!("Archive root: {}", config.archive_root().display());
    log::info!("Database path: {}", config.db_path().display());
    log::info!("LLM model: {}", config.extraction.llm_model);
    log::info!("Embedding model: {} ({} dimensions)",
        config.extraction.embed_model,
        config.extraction.embedding_dimensions);

    let db = Db::new(config.db_path());

    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    log::info!("Database initialized successfully");

    verify_database_schema(&db).await?;

    log::info!("Ready to serve: run `paperflow serve`");

    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    use paperflow::error::PaperflowError;

    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        for table in ["papers", "schema_migrations"] {
            if !tables.iter().any(|t| t == table) {
                return Err(PaperflowError::Config(format!("Missing table: {}", table)));
            }
            log::debug!("✓ Table exists: {}", table);
        }

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name")?;
        let indexes: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        for index_name in [
            "idx_papers_fingerprint",
            "idx_papers_source_path",
            "idx_papers_status",
        ] {
            if indexes.iter().any(|i| i == index_name) {
                log::debug!("✓ Index exists: {}", index_name);
            } else {
                return Err(PaperflowError::Config(format!("Missing index: {}", index_name)));
            }
        }

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(PaperflowError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }
        log::debug!("✓ Journal mode: WAL");

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(PaperflowError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");

        Ok(())
    }).await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}
