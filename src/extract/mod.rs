//! Extraction client: the four-stage external pipeline (parse, metadata,
//! summary, embedding) behind a trait so tests can inject failures.

pub mod ollama;

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::model::{PaperMetadata, PaperSummary};

pub use ollama::OllamaExtractor;

/// Failure of an extraction stage, classified for the retry policy.
///
/// Transient failures (timeouts, rate limits, 5xx) are worth re-running;
/// permanent ones (corrupt input, schema-invalid model output) are not.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("transient extraction failure: {0}")]
    Transient(String),

    #[error("permanent extraction failure: {0}")]
    Permanent(String),
}

impl ExtractError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ExtractError::Permanent(_))
    }
}

/// The external extraction pipeline as four independently retryable calls.
///
/// Each call may be slow (seconds to minutes) and is invoked under the
/// scheduler's per-stage timeout. Implementations must be safe to share
/// across the worker pool.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Convert a PDF on disk to markdown via the parser service.
    async fn parse_to_markdown(&self, pdf_path: &Path) -> Result<String, ExtractError>;

    /// Extract bibliographic metadata from parsed markdown.
    async fn extract_metadata(&self, markdown: &str) -> Result<PaperMetadata, ExtractError>;

    /// Generate the structured summary sections from parsed markdown.
    async fn summarize(&self, markdown: &str) -> Result<PaperSummary, ExtractError>;

    /// Embed a piece of text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExtractError>;
}

fn references_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^(#{1,6}\s*)?(references|reference|bibliography)\s*$")
            .expect("references heading regex")
    })
}

/// Drop the references/bibliography section and everything after it.
///
/// Citation lists dominate token counts without adding extractable content,
/// so they are removed before any LLM call.
pub fn strip_references(markdown: &str) -> String {
    match references_heading().find(markdown) {
        Some(m) => markdown[..m.start()].trim_end().to_string(),
        None => markdown.to_string(),
    }
}
