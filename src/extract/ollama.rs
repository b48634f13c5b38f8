//! Production extraction client: a PDF parser service plus an
//! Ollama-compatible API for metadata, summary, and embedding calls.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ExtractionConfig;
use crate::model::{PaperMetadata, PaperSummary};
use super::{ExtractError, ExtractionClient};

/// Metadata extraction reads only the head of the paper; the title block,
/// authors, and abstract are always there and the rest just burns tokens.
const METADATA_HEAD_CHARS: usize = 4000;

/// Request structure for the parser service
#[derive(Serialize)]
struct ParseRequest<'a> {
    path: &'a str,
}

/// Response structure from the parser service
#[derive(Deserialize)]
struct ParseResponse {
    markdown: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Request structure for the chat completion endpoint
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    format: serde_json::Value,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Response structure from the chat completion endpoint
#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

/// Request structure for the embeddings endpoint
#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

/// Response structure from the embeddings endpoint
#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Extraction client backed by HTTP services
///
/// Stage timeouts are enforced by the scheduler; the client only carries a
/// connect timeout so a dead service fails fast instead of hanging.
pub struct OllamaExtractor {
    client: Client,
    parser_url: String,
    llm_url: String,
    llm_model: String,
    embed_model: String,
    dimensions: usize,
}

impl OllamaExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            parser_url: config.parser_url.clone(),
            llm_url: config.llm_url.trim_end_matches('/').to_string(),
            llm_model: config.llm_model.clone(),
            embed_model: config.embed_model.clone(),
            dimensions: config.embedding_dimensions,
        }
    }

    /// Map a transport-level error to the retry taxonomy.
    fn classify_request_error(context: &str, e: reqwest::Error) -> ExtractError {
        if e.is_timeout() || e.is_connect() {
            ExtractError::Transient(format!("{}: {}", context, e))
        } else if e.is_decode() {
            ExtractError::Permanent(format!("{}: malformed response: {}", context, e))
        } else {
            ExtractError::Transient(format!("{}: {}", context, e))
        }
    }

    /// Map an HTTP status to the retry taxonomy.
    ///
    /// 429 and 5xx are service-side conditions worth retrying; any other
    /// non-success status means the service rejected this input.
    fn classify_status(context: &str, status: StatusCode, body: &str) -> ExtractError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ExtractError::Transient(format!("{}: HTTP {}: {}", context, status, body))
        } else {
            ExtractError::Permanent(format!("{}: HTTP {}: {}", context, status, body))
        }
    }

    async fn chat_json(&self, prompt: &str, format: serde_json::Value) -> Result<String, ExtractError> {
        let request = ChatRequest {
            model: &self.llm_model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            format,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.llm_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_request_error("chat", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Self::classify_status("chat", status, &body));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Self::classify_request_error("chat", e))?;

        Ok(result.message.content)
    }
}

/// Truncate to a character budget without splitting a code point.
fn head_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn metadata_prompt(markdown: &str) -> String {
    format!(
        "Given the following research paper in Markdown format, extract the following fields as JSON:\n\
         - title\n\
         - authors (as a list)\n\
         - journal_name\n\
         - volume\n\
         - issue\n\
         - year_of_publication\n\
         - abstract\n\
         - keywords (as a list)\n\n\
         Return only valid JSON matching this schema. Do not include any explanation or extra text.\n\n\
         Markdown:\n{}",
        head_chars(markdown, METADATA_HEAD_CHARS)
    )
}

fn summary_prompt(markdown: &str) -> String {
    format!(
        "Please analyze the following academic paper thoroughly and provide structured responses to \
         each of the following aspects in necessary detail. Be precise, concise, and maintain an \
         academic tone:\n\
         1. Summary: Summarize the entire research paper in 10-20 sentences. Focus on the core objective, approach, and findings.\n\
         2. Previous_Work: What is the theoretical background and related work in the field?\n\
         3. Hypothesis: What is the hypothesis of the paper, and what problem is it trying to solve?\n\
         4. Distinction: What is the key distinction or novel contribution compared to prior research in the same field?\n\
         5. Methodology: Describe the research design and methodology, including participants (if any), tools, procedures, models, and statistical analyses.\n\
         6. Results: Interpret the main findings, highlighting statistical outcomes and crucial figures or tables.\n\
         7. Limitations: What are the limitations of the study?\n\
         8. Implications: Explain the broader implications for theory, practice, or future research.\n\n\
         Return only valid JSON matching this schema. Do not include any explanation or extra text except for the JSON.\n\n\
         Markdown:\n{}",
        markdown
    )
}

fn metadata_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "authors": {"type": "array", "items": {"type": "string"}},
            "journal_name": {"type": ["string", "null"]},
            "volume": {"type": ["string", "null"]},
            "issue": {"type": ["string", "null"]},
            "year_of_publication": {"type": ["integer", "null"]},
            "abstract": {"type": ["string", "null"]},
            "keywords": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["title"]
    })
}

fn summary_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "previous_work": {"type": "string"},
            "hypothesis": {"type": "string"},
            "distinction": {"type": "string"},
            "methodology": {"type": "string"},
            "results": {"type": "string"},
            "limitations": {"type": "string"},
            "implications": {"type": "string"}
        },
        "required": [
            "summary", "previous_work", "hypothesis", "distinction",
            "methodology", "results", "limitations", "implications"
        ]
    })
}

#[async_trait]
impl ExtractionClient for OllamaExtractor {
    async fn parse_to_markdown(&self, pdf_path: &Path) -> Result<String, ExtractError> {
        let request = ParseRequest {
            path: pdf_path.to_str().ok_or_else(|| {
                ExtractError::Permanent(format!("non-UTF8 path: {}", pdf_path.display()))
            })?,
        };

        let response = self
            .client
            .post(&self.parser_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_request_error("parse", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Self::classify_status("parse", status, &body));
        }

        let result: ParseResponse = response
            .json()
            .await
            .map_err(|e| Self::classify_request_error("parse", e))?;

        if result.markdown.trim().is_empty() {
            return Err(ExtractError::Permanent(
                "parse: empty markdown output".to_string(),
            ));
        }

        Ok(result.markdown)
    }

    async fn extract_metadata(&self, markdown: &str) -> Result<PaperMetadata, ExtractError> {
        let content = self
            .chat_json(&metadata_prompt(markdown), metadata_schema())
            .await?;

        serde_json::from_str(&content).map_err(|e| {
            ExtractError::Permanent(format!("metadata: model output failed validation: {}", e))
        })
    }

    async fn summarize(&self, markdown: &str) -> Result<PaperSummary, ExtractError> {
        let content = self
            .chat_json(&summary_prompt(markdown), summary_schema())
            .await?;

        serde_json::from_str(&content).map_err(|e| {
            ExtractError::Permanent(format!("summary: model output failed validation: {}", e))
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExtractError> {
        let request = EmbeddingsRequest {
            model: &self.embed_model,
            prompt: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.llm_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_request_error("embed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Self::classify_status("embed", status, &body));
        }

        let result: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Self::classify_request_error("embed", e))?;

        // A wrong-dimension vector would poison similarity search; refuse it.
        if result.embedding.len() != self.dimensions {
            return Err(ExtractError::Permanent(format!(
                "embed: expected {} dimensions, got {}",
                self.dimensions,
                result.embedding.len()
            )));
        }

        Ok(result.embedding)
    }
}
