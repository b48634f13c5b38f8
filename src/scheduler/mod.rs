//! Ingestion scheduler: the single authority deciding what gets processed,
//! when, and with what concurrency.
//!
//! Both producers (startup/periodic scan and the live watcher) funnel into
//! `submit`, which reconciles the file against the store, reserves its
//! fingerprint in the in-flight set, and dispatches a job onto a bounded
//! intake queue consumed by a fixed-size worker pool. The in-flight set is
//! the only shared mutable state; a fingerprint leaves it only when its
//! paper reaches `processed` or `failed`, which is what guarantees
//! at-most-one concurrent pipeline run per document.

mod pipeline;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::db::Db;
use crate::error::{PaperflowError, Result};
use crate::extract::ExtractionClient;
use crate::model::PaperStatus;
use crate::scan::{compute_fingerprint, FileMetadata};
use crate::store;

use pipeline::{run_pipeline, PipelineEnd, Stage, StageFailure};

/// How a submission behaves when the intake queue is full: the startup scan
/// applies backpressure, the watcher drops and relies on the periodic
/// rescan for eventual consistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Block,
    Drop,
}

/// What happened to a submitted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A job was dispatched to the worker pool.
    Enqueued,
    /// The fingerprint is already being processed; coalesced.
    AlreadyInFlight,
    /// Unchanged file, already fully processed.
    AlreadyProcessed,
    /// The paper is failed and waits for a manual retry.
    FailedAwaitingRetry,
    /// Drop-mode submission hit a full queue.
    QueueFull,
    /// The scheduler no longer accepts work.
    ShuttingDown,
}

/// Ephemeral unit of scheduled work; never persisted.
#[derive(Debug, Clone)]
struct IngestJob {
    paper_id: String,
    fingerprint: String,
    source_path: PathBuf,
    enqueued_at: Instant,
}

pub struct IngestionScheduler {
    db: Db,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// None once shutdown has been requested.
    intake: Mutex<Option<mpsc::Sender<IngestJob>>>,
    shutting_down: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionScheduler {
    /// Spawn the worker pool and return the running scheduler.
    pub fn start(db: Db, extractor: Arc<dyn ExtractionClient>, config: PipelineConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<IngestJob>(config.queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                db.clone(),
                Arc::clone(&extractor),
                config.clone(),
                Arc::clone(&in_flight),
                Arc::clone(&rx),
                tx.clone(),
                Arc::clone(&shutting_down),
            )));
        }

        log::info!(
            "ingestion scheduler started ({} workers, queue depth {})",
            config.workers,
            config.queue_depth
        );

        Arc::new(Self {
            db,
            in_flight,
            intake: Mutex::new(Some(tx)),
            shutting_down,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a candidate file for ingestion.
    ///
    /// Idempotent: an unchanged processed file is a no-op, a fingerprint
    /// already in flight is coalesced, a changed file resets its existing
    /// row in place (the id is preserved).
    pub async fn submit(&self, file: &FileMetadata, mode: SubmitMode) -> Result<SubmitOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(SubmitOutcome::ShuttingDown);
        }

        let fingerprint = compute_fingerprint(&file.absolute_path)?;

        // Admission: check-and-insert under the lock, nothing else.
        {
            let mut set = self.in_flight.lock().unwrap();
            if !set.insert(fingerprint.clone()) {
                log::debug!("{}: already in flight, coalesced", file.relative_path);
                return Ok(SubmitOutcome::AlreadyInFlight);
            }
        }

        // The reservation is held until a worker finishes the paper; every
        // non-enqueued outcome below must give it back.
        let outcome = self.reconcile_and_enqueue(file, &fingerprint, mode).await;
        match &outcome {
            Ok(SubmitOutcome::Enqueued) => {}
            _ => self.release(&fingerprint),
        }
        outcome
    }

    /// Reconcile the file against the store, then dispatch.
    async fn reconcile_and_enqueue(
        &self,
        file: &FileMetadata,
        fingerprint: &str,
        mode: SubmitMode,
    ) -> Result<SubmitOutcome> {
        let source_path = file.absolute_path.to_string_lossy().to_string();

        if let Some(existing) = store::find_by_fingerprint(&self.db, fingerprint).await? {
            match existing.status {
                PaperStatus::Processed => {
                    if existing.source_path != source_path {
                        // Same content at a new location: record the rename.
                        store::update_source_path(
                            &self.db,
                            &existing.id,
                            fingerprint,
                            &source_path,
                            file.folder_name.as_deref(),
                        )
                        .await?;
                    }
                    return Ok(SubmitOutcome::AlreadyProcessed);
                }
                PaperStatus::Failed => {
                    // Exhausted its attempt budget; only an operator retry
                    // may re-enter the pipeline.
                    return Ok(SubmitOutcome::FailedAwaitingRetry);
                }
                _ => {
                    // Pending, or an in-progress status left by a previous
                    // process: no worker owns it now, so it is resumable.
                    store::set_status(&self.db, &existing.id, fingerprint, PaperStatus::Pending)
                        .await?;
                    return self
                        .enqueue(existing.id, fingerprint, file.absolute_path.clone(), mode)
                        .await;
                }
            }
        }

        if let Some(by_path) = store::find_by_source_path(&self.db, &source_path).await? {
            if by_path.fingerprint != fingerprint {
                // File content changed: reset the row in place.
                store::reset_for_reprocessing(&self.db, &by_path.id, fingerprint).await?;
                log::info!(
                    "{}: content changed, reprocessing (paper {})",
                    file.relative_path,
                    by_path.id
                );
                return self
                    .enqueue(by_path.id, fingerprint, file.absolute_path.clone(), mode)
                    .await;
            }
        }

        let id = store::insert_paper(&self.db, file, fingerprint).await?;
        log::info!("{}: new paper {}", file.relative_path, id);
        self.enqueue(id, fingerprint, file.absolute_path.clone(), mode)
            .await
    }

    async fn enqueue(
        &self,
        paper_id: String,
        fingerprint: &str,
        source_path: PathBuf,
        mode: SubmitMode,
    ) -> Result<SubmitOutcome> {
        let job = IngestJob {
            paper_id,
            fingerprint: fingerprint.to_string(),
            source_path,
            enqueued_at: Instant::now(),
        };

        let sender = self.intake.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Ok(SubmitOutcome::ShuttingDown);
        };

        match mode {
            SubmitMode::Block => {
                if sender.send(job).await.is_err() {
                    return Ok(SubmitOutcome::ShuttingDown);
                }
            }
            SubmitMode::Drop => {
                if let Err(e) = sender.try_send(job) {
                    match e {
                        mpsc::error::TrySendError::Full(job) => {
                            log::warn!(
                                "intake queue full, dropping watch event for {} (periodic rescan will pick it up)",
                                job.source_path.display()
                            );
                            return Ok(SubmitOutcome::QueueFull);
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            return Ok(SubmitOutcome::ShuttingDown);
                        }
                    }
                }
            }
        }

        Ok(SubmitOutcome::Enqueued)
    }

    /// Flip a failed paper back to pending and put it on the queue.
    pub async fn retry(&self, paper_id: &str) -> Result<SubmitOutcome> {
        if !store::reset_failed(&self.db, paper_id).await? {
            return Err(PaperflowError::InvalidInput(format!(
                "paper {} is not in a failed state",
                paper_id
            )));
        }

        let Some(row) = store::find_by_id(&self.db, paper_id).await? else {
            return Err(PaperflowError::PaperNotFound(paper_id.to_string()));
        };

        {
            let mut set = self.in_flight.lock().unwrap();
            if !set.insert(row.fingerprint.clone()) {
                return Ok(SubmitOutcome::AlreadyInFlight);
            }
        }

        let outcome = self
            .enqueue(
                row.id,
                &row.fingerprint,
                PathBuf::from(&row.source_path),
                SubmitMode::Block,
            )
            .await;
        match &outcome {
            Ok(SubmitOutcome::Enqueued) => {}
            _ => self.release(&row.fingerprint),
        }
        outcome
    }

    /// Number of fingerprints currently being processed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Stop accepting work. In-flight workers finish their current stage
    /// and persist a consistent status before exiting.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Dropping the sender wakes idle workers out of recv.
        self.intake.lock().unwrap().take();
        log::info!("ingestion scheduler shutting down");
    }

    /// Wait for the worker pool to exit. Call after `shutdown`.
    pub async fn join(&self) {
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn release(&self, fingerprint: &str) {
        self.in_flight.lock().unwrap().remove(fingerprint);
    }
}

/// Exponential backoff for attempt `n` (1-based), clamped to the ceiling.
fn backoff_delay(config: &PipelineConfig, attempt: u32) -> Duration {
    let base = Duration::from_millis(config.backoff_base_ms);
    let ceiling = Duration::from_millis(config.backoff_ceiling_ms);
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(ceiling)
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    db: Db,
    extractor: Arc<dyn ExtractionClient>,
    config: PipelineConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestJob>>>,
    retry_tx: mpsc::Sender<IngestJob>,
    shutting_down: Arc<AtomicBool>,
) {
    log::debug!("worker {} started", worker_id);
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        if shutting_down.load(Ordering::SeqCst) {
            // Drain without starting new work; the row stays pending and the
            // next startup scan resubmits it.
            normalize_pending(&db, &in_flight, &job).await;
            continue;
        }

        process_job(
            worker_id,
            &db,
            extractor.as_ref(),
            &config,
            &in_flight,
            &retry_tx,
            &shutting_down,
            job,
        )
        .await;
    }
    log::debug!("worker {} exited", worker_id);
}

/// Put a job's paper back to pending and release its fingerprint.
async fn normalize_pending(db: &Db, in_flight: &Mutex<HashSet<String>>, job: &IngestJob) {
    if let Err(e) = store::set_status(db, &job.paper_id, &job.fingerprint, PaperStatus::Pending).await {
        log::error!("failed to reset paper {} to pending: {}", job.paper_id, e);
    }
    in_flight.lock().unwrap().remove(&job.fingerprint);
}

#[allow(clippy::too_many_arguments)]
async fn process_job(
    worker_id: usize,
    db: &Db,
    extractor: &dyn ExtractionClient,
    config: &PipelineConfig,
    in_flight: &Arc<Mutex<HashSet<String>>>,
    retry_tx: &mpsc::Sender<IngestJob>,
    shutting_down: &Arc<AtomicBool>,
    job: IngestJob,
) {
    let start = Instant::now();
    log::info!(
        "worker {}: processing {} (paper {}, queued for {:?})",
        worker_id,
        job.source_path.display(),
        job.paper_id,
        job.enqueued_at.elapsed()
    );

    match run_pipeline(db, extractor, config, &job.paper_id, &job.fingerprint, &job.source_path, shutting_down).await {
        Ok(PipelineEnd::Completed) => {
            in_flight.lock().unwrap().remove(&job.fingerprint);
            log::info!(
                "worker {}: processed {} in {:?}",
                worker_id,
                job.source_path.display(),
                start.elapsed()
            );
        }
        Ok(PipelineEnd::Superseded) => {
            // The row was reset for a newer file version mid-run; the new
            // version holds its own reservation under its own fingerprint.
            in_flight.lock().unwrap().remove(&job.fingerprint);
            log::info!(
                "worker {}: {} superseded by a newer version, dropping stale run",
                worker_id,
                job.source_path.display()
            );
        }
        Ok(PipelineEnd::Interrupted) => {
            normalize_pending(db, in_flight, &job).await;
            log::info!(
                "worker {}: shutdown during {}, reset to pending",
                worker_id,
                job.source_path.display()
            );
        }
        Err(StageFailure::Store(e)) => {
            // Infrastructure failure: does not count against the document's
            // attempt budget. Leave the row pending for the next rescan.
            log::error!(
                "worker {}: store unavailable while processing {}: {}",
                worker_id,
                job.source_path.display(),
                e
            );
            normalize_pending(db, in_flight, &job).await;
        }
        Err(StageFailure::Extract { stage, error }) => {
            handle_stage_failure(db, config, in_flight, retry_tx, shutting_down, job, stage, error)
                .await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_stage_failure(
    db: &Db,
    config: &PipelineConfig,
    in_flight: &Arc<Mutex<HashSet<String>>>,
    retry_tx: &mpsc::Sender<IngestJob>,
    shutting_down: &Arc<AtomicBool>,
    job: IngestJob,
    stage: Stage,
    error: crate::extract::ExtractError,
) {
    let attempts = match store::bump_attempt(db, &job.paper_id, &job.fingerprint).await {
        Ok(Some(n)) => n,
        Ok(None) => {
            // Reset underneath us; nothing left to account for.
            in_flight.lock().unwrap().remove(&job.fingerprint);
            return;
        }
        Err(e) => {
            log::error!("failed to record attempt for paper {}: {}", job.paper_id, e);
            normalize_pending(db, in_flight, &job).await;
            return;
        }
    };

    // Parsing failures are terminal on the first attempt: the input itself
    // is bad, and retrying a corrupt PDF wastes the whole budget. Permanent
    // errors at any stage are terminal too.
    let terminal =
        stage == Stage::Parsing || error.is_permanent() || attempts >= config.max_attempts;

    if terminal {
        let message = format!("{} stage: {}", stage, error);
        if let Err(e) = store::mark_failed(db, &job.paper_id, &job.fingerprint, &message).await {
            log::error!("failed to mark paper {} failed: {}", job.paper_id, e);
        }
        in_flight.lock().unwrap().remove(&job.fingerprint);
        log::error!(
            "paper {} failed after {} attempt(s): {}",
            job.paper_id,
            attempts,
            message
        );
        return;
    }

    // Transient: re-run the whole pipeline from pending after a backoff.
    // The fingerprint stays reserved so duplicate watcher events keep
    // coalescing while we wait.
    if let Err(e) = store::set_status(db, &job.paper_id, &job.fingerprint, PaperStatus::Pending).await
    {
        log::error!("failed to reset paper {} for retry: {}", job.paper_id, e);
        normalize_pending(db, in_flight, &job).await;
        return;
    }

    let delay = backoff_delay(config, attempts);
    log::warn!(
        "paper {}: {} stage failed transiently (attempt {}/{}), retrying in {:?}: {}",
        job.paper_id,
        stage,
        attempts,
        config.max_attempts,
        delay,
        error
    );

    let retry_tx = retry_tx.clone();
    let in_flight = Arc::clone(in_flight);
    let shutting_down = Arc::clone(shutting_down);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if shutting_down.load(Ordering::SeqCst) || retry_tx.send(job.clone()).await.is_err() {
            // Row is already pending; just give back the reservation.
            in_flight.lock().unwrap().remove(&job.fingerprint);
        }
    });
}
