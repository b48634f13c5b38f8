//! Weighted similarity ranking over processed papers.
//!
//! Score = title_weight * cos(title) + abstract_weight * cos(abstract),
//! computed over every processed paper's stored embedding pair. The corpus
//! is one row per paper with two fixed vectors, so a linear scan is cheap;
//! there is no ANN index to consult.

use std::sync::Arc;

use crate::cache::EmbeddingCache;
use crate::db::Db;
use crate::error::{PaperflowError, Result};
use crate::extract::ExtractionClient;
use crate::store::{self, EmbeddingRow};

/// One ranked result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RankedPaper {
    pub id: String,
    pub title: Option<String>,
    pub score: f32,
}

/// Normalize a weight pair to sum to 1.
///
/// Callers pass whatever they like; ranking always uses a convex
/// combination so scores stay in the cosine range.
pub fn normalize_weights(title_weight: f32, abstract_weight: f32) -> (f32, f32) {
    let sum = title_weight + abstract_weight;
    if sum <= 0.0 || !sum.is_finite() {
        // Degenerate input: fall back to an even split.
        return (0.5, 0.5);
    }
    (title_weight / sum, abstract_weight / sum)
}

/// Compute cosine similarity between two vectors
///
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(
        a.len(),
        b.len(),
        "Vectors must have same length for cosine similarity"
    );

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();

    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Rank candidates against a reference embedding pair.
///
/// Results below `threshold` are excluded (inclusive comparison); ties are
/// broken by most recent `updated_at`; `exclude_id` removes the reference
/// paper itself when ranking "similar to paper X".
pub fn rank(
    candidates: &[EmbeddingRow],
    title_vec: &[f32],
    abstract_vec: &[f32],
    title_weight: f32,
    abstract_weight: f32,
    limit: usize,
    threshold: f32,
    exclude_id: Option<&str>,
) -> Vec<RankedPaper> {
    let (title_weight, abstract_weight) = normalize_weights(title_weight, abstract_weight);

    let mut scored: Vec<(f32, &EmbeddingRow)> = Vec::new();
    for row in candidates {
        if Some(row.id.as_str()) == exclude_id {
            continue;
        }
        // Dimension drift (e.g. after an embedding-model change) makes a
        // candidate incomparable, not an error.
        if row.title_embedding.len() != title_vec.len()
            || row.abstract_embedding.len() != abstract_vec.len()
        {
            log::warn!("skipping paper {} with mismatched embedding dimensions", row.id);
            continue;
        }

        let score = title_weight * cosine_similarity(title_vec, &row.title_embedding)
            + abstract_weight * cosine_similarity(abstract_vec, &row.abstract_embedding);

        if score >= threshold {
            scored.push((score, row));
        }
    }

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.updated_at.cmp(&a.1.updated_at))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|(score, row)| RankedPaper {
            id: row.id.clone(),
            title: row.title.clone(),
            score,
        })
        .collect()
}

/// Rank papers similar to an existing processed paper.
pub async fn similar_to_paper(
    db: &Db,
    paper_id: &str,
    title_weight: f32,
    abstract_weight: f32,
    limit: usize,
    threshold: f32,
) -> Result<Vec<RankedPaper>> {
    let Some((title_vec, abstract_vec)) = store::get_embeddings(db, paper_id).await? else {
        return Err(PaperflowError::PaperNotFound(format!(
            "{} (not found or not yet processed)",
            paper_id
        )));
    };

    let candidates = store::load_processed_embeddings(db).await?;
    Ok(rank(
        &candidates,
        &title_vec,
        &abstract_vec,
        title_weight,
        abstract_weight,
        limit,
        threshold,
        Some(paper_id),
    ))
}

/// Rank papers similar to a free-text query.
///
/// The query is embedded once (LRU-cached) and compared against both the
/// title and abstract channels.
pub async fn similar_to_query(
    db: &Db,
    extractor: &dyn ExtractionClient,
    cache: Option<&Arc<EmbeddingCache>>,
    query: &str,
    title_weight: f32,
    abstract_weight: f32,
    limit: usize,
    threshold: f32,
) -> Result<Vec<RankedPaper>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PaperflowError::InvalidInput("empty query".to_string()));
    }

    let query_vec = match cache.and_then(|c| c.get(query)) {
        Some(cached) => {
            log::debug!("query embedding cache hit");
            cached
        }
        None => {
            let vec = extractor.embed(query).await?;
            if let Some(c) = cache {
                c.put(query.to_string(), vec.clone());
            }
            vec
        }
    };

    let candidates = store::load_processed_embeddings(db).await?;
    Ok(rank(
        &candidates,
        &query_vec,
        &query_vec,
        title_weight,
        abstract_weight,
        limit,
        threshold,
        None,
    ))
}
