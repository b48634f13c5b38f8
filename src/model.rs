use serde::{Deserialize, Serialize};

/// Lifecycle of a paper through the extraction pipeline.
///
/// Progression is strictly forward (pending → parsing → extracting →
/// summarizing → embedding → processed) except `failed`, which is terminal
/// but retryable back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperStatus {
    Pending,
    Parsing,
    Extracting,
    Summarizing,
    Embedding,
    Processed,
    Failed,
}

impl PaperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaperStatus::Pending => "pending",
            PaperStatus::Parsing => "parsing",
            PaperStatus::Extracting => "extracting",
            PaperStatus::Summarizing => "summarizing",
            PaperStatus::Embedding => "embedding",
            PaperStatus::Processed => "processed",
            PaperStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaperStatus::Pending),
            "parsing" => Some(PaperStatus::Parsing),
            "extracting" => Some(PaperStatus::Extracting),
            "summarizing" => Some(PaperStatus::Summarizing),
            "embedding" => Some(PaperStatus::Embedding),
            "processed" => Some(PaperStatus::Processed),
            "failed" => Some(PaperStatus::Failed),
            _ => None,
        }
    }

    /// True for pipeline stages a worker owns (parsing through embedding).
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            PaperStatus::Parsing
                | PaperStatus::Extracting
                | PaperStatus::Summarizing
                | PaperStatus::Embedding
        )
    }
}

impl std::fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bibliographic metadata extracted from a paper by the LLM.
///
/// Every field except the title may be absent; absence is not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub journal_name: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub year_of_publication: Option<i32>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Structured summary sections generated by the LLM in a single call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperSummary {
    pub summary: String,
    pub previous_work: String,
    pub hypothesis: String,
    pub distinction: String,
    pub methodology: String,
    pub results: String,
    pub limitations: String,
    pub implications: String,
}

/// A paper row as persisted in the document store.
#[derive(Debug, Clone, Serialize)]
pub struct Paper {
    pub id: String,
    pub fingerprint: String,
    pub source_path: String,
    pub folder_name: Option<String>,
    pub status: PaperStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub metadata: Option<PaperMetadata>,
    pub markdown: Option<String>,
    pub summary: Option<PaperSummary>,
    pub title_embedding: Option<Vec<f32>>,
    pub abstract_embedding: Option<Vec<f32>>,
    pub created_at: String,
    pub updated_at: String,
}

/// Aggregate status counts for the archive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub processed: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            PaperStatus::Pending,
            PaperStatus::Parsing,
            PaperStatus::Extracting,
            PaperStatus::Summarizing,
            PaperStatus::Embedding,
            PaperStatus::Processed,
            PaperStatus::Failed,
        ] {
            assert_eq!(PaperStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaperStatus::parse("bogus"), None);
    }

    #[test]
    fn test_in_progress_classification() {
        assert!(!PaperStatus::Pending.is_in_progress());
        assert!(PaperStatus::Parsing.is_in_progress());
        assert!(PaperStatus::Embedding.is_in_progress());
        assert!(!PaperStatus::Processed.is_in_progress());
        assert!(!PaperStatus::Failed.is_in_progress());
    }

    #[test]
    fn test_metadata_deserializes_llm_json() {
        let json = r#"{
            "title": "Attention Is All You Need",
            "authors": ["Vaswani", "Shazeer"],
            "journal_name": null,
            "year_of_publication": 2017,
            "abstract": "The dominant sequence transduction models...",
            "keywords": ["transformers", "attention"]
        }"#;
        let meta: PaperMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.title, "Attention Is All You Need");
        assert_eq!(meta.authors.len(), 2);
        assert!(meta.abstract_text.is_some());
        assert!(meta.volume.is_none());
    }

    #[test]
    fn test_metadata_tolerates_missing_optionals() {
        let meta: PaperMetadata = serde_json::from_str(r#"{"title": "T"}"#).unwrap();
        assert_eq!(meta.title, "T");
        assert!(meta.authors.is_empty());
        assert!(meta.keywords.is_empty());
    }
}
