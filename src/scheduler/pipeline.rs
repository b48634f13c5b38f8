//! The per-document pipeline a worker drives: parse → extract → summarize
//! → embed, persisting each stage's output and advancing the status before
//! the next stage begins. Retries re-run the whole pipeline from pending;
//! the external services are stateless, so resuming mid-pipeline buys
//! nothing correctness-wise.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::db::Db;
use crate::error::Result;
use crate::extract::{strip_references, ExtractError, ExtractionClient};
use crate::model::PaperStatus;
use crate::store;

/// Pipeline stage names, for status transitions and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parsing,
    Extracting,
    Summarizing,
    Embedding,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Parsing => "parsing",
            Stage::Extracting => "extracting",
            Stage::Summarizing => "summarizing",
            Stage::Embedding => "embedding",
        };
        f.write_str(s)
    }
}

/// How a pipeline run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// All four stages succeeded; the paper is processed.
    Completed,
    /// The row was reset for a newer file version; this run's writes were
    /// fenced out and the result discarded.
    Superseded,
    /// Shutdown was requested between stages; the paper was left pending.
    Interrupted,
}

/// Why a pipeline run failed.
pub enum StageFailure {
    /// An extraction stage failed; carries the retry classification.
    Extract { stage: Stage, error: ExtractError },
    /// The document store itself is unavailable (infrastructure, not content).
    Store(crate::error::PaperflowError),
}

/// Retry a store operation a few times before giving up.
///
/// Store failures are infrastructure trouble and are not charged against
/// the document's own attempt budget.
async fn retry_store<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < 2 => {
                log::warn!("store error (retry {}): {}", attempt + 1, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run one extraction stage under the configured timeout.
///
/// A timeout is a transient failure like any other slow-service condition.
async fn call_stage<T, Fut>(stage: Stage, timeout: Duration, fut: Fut) -> std::result::Result<T, StageFailure>
where
    Fut: Future<Output = std::result::Result<T, ExtractError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(StageFailure::Extract { stage, error }),
        Err(_) => Err(StageFailure::Extract {
            stage,
            error: ExtractError::Transient(format!("{} stage timed out", stage)),
        }),
    }
}

/// Drive a paper through all four stages.
///
/// Every store write is fenced on the job's fingerprint; a `false` return
/// from a stage write means the row was reset underneath us and the run is
/// superseded. Shutdown is honored between stages, never mid-stage.
pub async fn run_pipeline(
    db: &Db,
    extractor: &dyn ExtractionClient,
    config: &crate::config::PipelineConfig,
    paper_id: &str,
    fingerprint: &str,
    source_path: &Path,
    shutting_down: &AtomicBool,
) -> std::result::Result<PipelineEnd, StageFailure> {
    let timeout = Duration::from_secs(config.stage_timeout_secs);

    let claimed = retry_store(|| store::set_status(db, paper_id, fingerprint, PaperStatus::Parsing))
        .await
        .map_err(StageFailure::Store)?;
    if !claimed {
        return Ok(PipelineEnd::Superseded);
    }

    // Stage 1: parse the PDF to markdown.
    let markdown = call_stage(Stage::Parsing, timeout, extractor.parse_to_markdown(source_path)).await?;
    let markdown = strip_references(&markdown);

    let ok = retry_store(|| store::store_parse_result(db, paper_id, fingerprint, &markdown))
        .await
        .map_err(StageFailure::Store)?;
    if !ok {
        return Ok(PipelineEnd::Superseded);
    }
    if shutting_down.load(Ordering::SeqCst) {
        return Ok(PipelineEnd::Interrupted);
    }

    // Stage 2: extract bibliographic metadata.
    let metadata = call_stage(Stage::Extracting, timeout, extractor.extract_metadata(&markdown)).await?;

    let ok = retry_store(|| store::store_metadata(db, paper_id, fingerprint, &metadata))
        .await
        .map_err(StageFailure::Store)?;
    if !ok {
        return Ok(PipelineEnd::Superseded);
    }
    if shutting_down.load(Ordering::SeqCst) {
        return Ok(PipelineEnd::Interrupted);
    }

    // Stage 3: generate the structured summary.
    let summary = call_stage(Stage::Summarizing, timeout, extractor.summarize(&markdown)).await?;

    let ok = retry_store(|| store::store_summary(db, paper_id, fingerprint, &summary))
        .await
        .map_err(StageFailure::Store)?;
    if !ok {
        return Ok(PipelineEnd::Superseded);
    }
    if shutting_down.load(Ordering::SeqCst) {
        return Ok(PipelineEnd::Interrupted);
    }

    // Stage 4: embed the title and abstract. When no abstract was
    // extracted, the generated summary stands in so the paper still gets a
    // usable second similarity channel.
    let title_embedding = call_stage(Stage::Embedding, timeout, extractor.embed(&metadata.title)).await?;
    let abstract_source = metadata
        .abstract_text
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&summary.summary);
    let abstract_embedding = call_stage(Stage::Embedding, timeout, extractor.embed(abstract_source)).await?;

    let ok = retry_store(|| {
        store::store_embeddings(db, paper_id, fingerprint, &title_embedding, &abstract_embedding)
    })
    .await
    .map_err(StageFailure::Store)?;
    if !ok {
        return Ok(PipelineEnd::Superseded);
    }

    Ok(PipelineEnd::Completed)
}
