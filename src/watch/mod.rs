//! Live archive watcher: push filesystem change notifications into the
//! ingestion scheduler.
//!
//! The notify callback world is bridged onto a plain channel consumed by an
//! async loop, which keeps backpressure and testing uniform with the scan
//! path. Watch submissions use drop mode: if the intake queue is full the
//! event is discarded with a warning, and the periodic rescan restores
//! eventual consistency.

mod watcher;

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::error::{PaperflowError, Result};
use crate::scan;
use crate::scheduler::{IngestionScheduler, SubmitMode, SubmitOutcome};

/// Handle one debounced path from the watcher.
///
/// Paths outside the root, non-PDFs, temp files, and files that vanished
/// before we got to them are ignored. Returns the submission outcome for
/// paths that made it to the scheduler.
pub async fn handle_watch_path(
    scheduler: &IngestionScheduler,
    root: &Path,
    path: &Path,
) -> Result<Option<SubmitOutcome>> {
    let Some(file) = scan::file_metadata_from_path(path, root)? else {
        return Ok(None);
    };

    let outcome = scheduler.submit(&file, SubmitMode::Drop).await?;
    log::debug!("watch: {} -> {:?}", file.relative_path, outcome);
    Ok(Some(outcome))
}

/// Run the watcher until shutdown: spawn the notify thread, then receive
/// debounced paths and submit each to the scheduler.
///
/// Watcher failures are non-fatal to the service; the caller keeps the
/// periodic rescan as a fallback discovery path.
pub async fn run_watcher(
    scheduler: Arc<IngestionScheduler>,
    root: std::path::PathBuf,
    debounce_ms: u64,
) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let rx = Arc::new(Mutex::new(rx));

    let thread_root = root.clone();
    std::thread::spawn(move || {
        if let Err(e) = watcher::run_watcher_thread(&thread_root, debounce_ms, tx) {
            log::error!("watcher thread error: {}", e);
        }
    });

    log::info!(
        "watching {} (debounce {} ms)",
        root.display(),
        debounce_ms
    );

    loop {
        let rx_clone = Arc::clone(&rx);
        let path = tokio::task::spawn_blocking(move || rx_clone.lock().unwrap().recv())
            .await
            .map_err(|e| PaperflowError::Config(format!("watcher task join: {}", e)))?;

        let path = match path {
            Ok(p) => p,
            Err(_) => break,
        };

        match handle_watch_path(scheduler.as_ref(), &root, &path).await {
            Ok(Some(SubmitOutcome::ShuttingDown)) => break,
            Ok(_) => {}
            Err(e) => {
                log::error!("watch: failed to handle {}: {}", path.display(), e);
            }
        }
    }

    log::warn!("watch event stream ended; discovery continues via periodic rescan");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::config::PipelineConfig;
    use crate::extract::{ExtractError, ExtractionClient};
    use crate::model::{PaperMetadata, PaperStatus, PaperSummary};
    use crate::store;

    /// Minimal always-succeeding client for adapter tests.
    struct StubExtractor;

    #[async_trait]
    impl ExtractionClient for StubExtractor {
        async fn parse_to_markdown(&self, _p: &Path) -> std::result::Result<String, ExtractError> {
            Ok("# Paper".to_string())
        }
        async fn extract_metadata(&self, _m: &str) -> std::result::Result<PaperMetadata, ExtractError> {
            Ok(PaperMetadata {
                title: "Paper".to_string(),
                abstract_text: Some("Abs".to_string()),
                ..Default::default()
            })
        }
        async fn summarize(&self, _m: &str) -> std::result::Result<PaperSummary, ExtractError> {
            Ok(PaperSummary::default())
        }
        async fn embed(&self, _t: &str) -> std::result::Result<Vec<f32>, ExtractError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            workers: 1,
            queue_depth: 8,
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_ceiling_ms: 4,
            stage_timeout_secs: 5,
            debounce_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_handle_watch_path_ignores_irrelevant_paths() {
        let (db, _db_dir) = store::tests::setup_test_db().await;
        let archive = TempDir::new().unwrap();
        let scheduler =
            IngestionScheduler::start(db, Arc::new(StubExtractor), test_config());

        // Non-PDF
        let txt = archive.path().join("notes.txt");
        std::fs::write(&txt, "text").unwrap();
        let out = handle_watch_path(scheduler.as_ref(), archive.path(), &txt)
            .await
            .unwrap();
        assert!(out.is_none());

        // Vanished file
        let gone = archive.path().join("gone.pdf");
        let out = handle_watch_path(scheduler.as_ref(), archive.path(), &gone)
            .await
            .unwrap();
        assert!(out.is_none());

        // Outside the root
        let other = TempDir::new().unwrap();
        let outside = other.path().join("elsewhere.pdf");
        std::fs::write(&outside, "%PDF").unwrap();
        let out = handle_watch_path(scheduler.as_ref(), archive.path(), &outside)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_handle_watch_path_submits_pdf() {
        let (db, _db_dir) = store::tests::setup_test_db().await;
        let archive = TempDir::new().unwrap();
        let scheduler =
            IngestionScheduler::start(db.clone(), Arc::new(StubExtractor), test_config());

        let pdf = archive.path().join("paper.pdf");
        std::fs::write(&pdf, "%PDF content").unwrap();

        let out = handle_watch_path(scheduler.as_ref(), archive.path(), &pdf)
            .await
            .unwrap();
        assert_eq!(out, Some(crate::scheduler::SubmitOutcome::Enqueued));

        // Wait for the pipeline to finish.
        let canonical = pdf.canonicalize().unwrap();
        for _ in 0..500 {
            if let Some(row) =
                store::find_by_source_path(&db, &canonical.to_string_lossy()).await.unwrap()
            {
                if row.status == PaperStatus::Processed {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("paper never reached processed");
    }
}
