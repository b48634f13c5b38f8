//! Document store: paper rows in SQLite.
//!
//! All pipeline writes are fenced on `(id, fingerprint)` so a row that was
//! reset for a newer version of the file cannot be clobbered by a worker
//! still finishing the old version; the stale worker sees zero updated rows
//! and abandons the job.

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{PaperflowError, Result};
use crate::model::{Paper, PaperMetadata, PaperStatus, PaperSummary, StatusCounts};
use crate::scan::FileMetadata;

/// Lightweight paper row without the large text/vector columns.
#[derive(Debug, Clone)]
pub struct PaperOverview {
    pub id: String,
    pub fingerprint: String,
    pub source_path: String,
    pub folder_name: Option<String>,
    pub status: PaperStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub title: Option<String>,
    pub updated_at: String,
}

/// Embedding pair of a processed paper, ready for ranking.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub id: String,
    pub title: Option<String>,
    pub updated_at: String,
    pub title_embedding: Vec<f32>,
    pub abstract_embedding: Vec<f32>,
}

/// Serialize an embedding as a little-endian f32 blob.
pub fn embedding_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Parse an embedding blob back to Vec<f32>.
///
/// Returns None if the blob length is not a multiple of 4.
pub fn blob_to_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }

    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_status(s: &str) -> rusqlite::Result<PaperStatus> {
    PaperStatus::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown paper status: {}", s),
            )),
        )
    })
}

fn overview_from_row(row: &Row<'_>) -> rusqlite::Result<PaperOverview> {
    let status: String = row.get(4)?;
    Ok(PaperOverview {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        source_path: row.get(2)?,
        folder_name: row.get(3)?,
        status: parse_status(&status)?,
        attempt_count: row.get::<_, i64>(5)? as u32,
        last_error: row.get(6)?,
        title: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const OVERVIEW_COLUMNS: &str =
    "id, fingerprint, source_path, folder_name, status, attempt_count, last_error, title, updated_at";

/// Insert a new pending paper for a discovered file.
///
/// Returns the assigned id. If a row with the same fingerprint already
/// exists (two producers raced), the existing id is returned instead.
pub async fn insert_paper(db: &Db, file: &FileMetadata, fingerprint: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let fingerprint = fingerprint.to_string();
    let source_path = file.absolute_path.to_string_lossy().to_string();
    let folder_name = file.folder_name.clone();
    let now = now_rfc3339();

    db.with_connection(move |conn| {
        conn.execute(
            r#"
            INSERT INTO papers (id, fingerprint, source_path, folder_name, status, attempt_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
            params![id, fingerprint, source_path, folder_name, now],
        )?;

        let existing: String = conn.query_row(
            "SELECT id FROM papers WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;

        Ok::<String, PaperflowError>(existing)
    })
    .await
}

/// Look up a paper by content fingerprint.
pub async fn find_by_fingerprint(db: &Db, fingerprint: &str) -> Result<Option<PaperOverview>> {
    let fingerprint = fingerprint.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM papers WHERE fingerprint = ?1",
            OVERVIEW_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![fingerprint], overview_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    })
    .await
}

/// Look up a paper by id (lightweight columns only).
pub async fn find_by_id(db: &Db, id: &str) -> Result<Option<PaperOverview>> {
    let id = id.to_string();
    db.with_connection(move |conn| {
        let sql = format!("SELECT {} FROM papers WHERE id = ?1", OVERVIEW_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], overview_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    })
    .await
}

/// Record a rename: same content, new location. Ids are not path-derived,
/// so the row just follows the file.
pub async fn update_source_path(
    db: &Db,
    id: &str,
    fingerprint: &str,
    source_path: &str,
    folder_name: Option<&str>,
) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let source_path = source_path.to_string();
    let folder_name = folder_name.map(|s| s.to_string());
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            "UPDATE papers SET source_path = ?3, folder_name = ?4, updated_at = ?5
             WHERE id = ?1 AND fingerprint = ?2",
            params![id, fingerprint, source_path, folder_name, now],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Look up a paper by source path.
pub async fn find_by_source_path(db: &Db, source_path: &str) -> Result<Option<PaperOverview>> {
    let source_path = source_path.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM papers WHERE source_path = ?1",
            OVERVIEW_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![source_path], overview_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    })
    .await
}

/// Reset a paper for reprocessing after its file changed on disk.
///
/// The id is preserved (downstream references stay valid); fingerprint,
/// status, and attempt bookkeeping start over, and stale embeddings are
/// cleared so the row drops out of similarity ranking until reprocessed.
pub async fn reset_for_reprocessing(db: &Db, id: &str, new_fingerprint: &str) -> Result<()> {
    let id = id.to_string();
    let new_fingerprint = new_fingerprint.to_string();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        conn.execute(
            r#"
            UPDATE papers
            SET fingerprint = ?2, status = 'pending', attempt_count = 0, last_error = NULL,
                title_embedding = NULL, abstract_embedding = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
            params![id, new_fingerprint, now],
        )?;
        Ok(())
    })
    .await
}

/// Flip a failed paper back to pending for a manual retry.
///
/// Returns false if the paper is not currently failed.
pub async fn reset_failed(db: &Db, id: &str) -> Result<bool> {
    let id = id.to_string();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            "UPDATE papers SET status = 'pending', attempt_count = 0, last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, now],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Set a paper's status, fenced on fingerprint.
pub async fn set_status(db: &Db, id: &str, fingerprint: &str, status: PaperStatus) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let status = status.as_str();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            "UPDATE papers SET status = ?3, updated_at = ?4 WHERE id = ?1 AND fingerprint = ?2",
            params![id, fingerprint, status, now],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Persist parsed markdown and advance to the extracting stage.
pub async fn store_parse_result(db: &Db, id: &str, fingerprint: &str, markdown: &str) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let markdown = markdown.to_string();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            "UPDATE papers SET markdown = ?3, status = 'extracting', updated_at = ?4
             WHERE id = ?1 AND fingerprint = ?2",
            params![id, fingerprint, markdown, now],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Persist extracted metadata and advance to the summarizing stage.
pub async fn store_metadata(db: &Db, id: &str, fingerprint: &str, meta: &PaperMetadata) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let authors = serde_json::to_string(&meta.authors)
        .map_err(|e| PaperflowError::Store(format!("serialize authors: {}", e)))?;
    let keywords = serde_json::to_string(&meta.keywords)
        .map_err(|e| PaperflowError::Store(format!("serialize keywords: {}", e)))?;
    let meta = meta.clone();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            r#"
            UPDATE papers
            SET title = ?3, authors = ?4, journal_name = ?5, volume = ?6, issue = ?7,
                publication_year = ?8, abstract = ?9, keywords = ?10,
                status = 'summarizing', updated_at = ?11
            WHERE id = ?1 AND fingerprint = ?2
            "#,
            params![
                id,
                fingerprint,
                meta.title,
                authors,
                meta.journal_name,
                meta.volume,
                meta.issue,
                meta.year_of_publication,
                meta.abstract_text,
                keywords,
                now,
            ],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Persist the structured summary and advance to the embedding stage.
pub async fn store_summary(db: &Db, id: &str, fingerprint: &str, summary: &PaperSummary) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let summary = summary.clone();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            r#"
            UPDATE papers
            SET summary = ?3, previous_work = ?4, hypothesis = ?5, distinction = ?6,
                methodology = ?7, results = ?8, limitations = ?9, implications = ?10,
                status = 'embedding', updated_at = ?11
            WHERE id = ?1 AND fingerprint = ?2
            "#,
            params![
                id,
                fingerprint,
                summary.summary,
                summary.previous_work,
                summary.hypothesis,
                summary.distinction,
                summary.methodology,
                summary.results,
                summary.limitations,
                summary.implications,
                now,
            ],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Persist both embeddings and mark the paper processed.
pub async fn store_embeddings(
    db: &Db,
    id: &str,
    fingerprint: &str,
    title_embedding: &[f32],
    abstract_embedding: &[f32],
) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let title_blob = embedding_to_blob(title_embedding);
    let abstract_blob = embedding_to_blob(abstract_embedding);
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            r#"
            UPDATE papers
            SET title_embedding = ?3, abstract_embedding = ?4, status = 'processed',
                last_error = NULL, updated_at = ?5
            WHERE id = ?1 AND fingerprint = ?2
            "#,
            params![id, fingerprint, title_blob, abstract_blob, now],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Increment the attempt counter, fenced on fingerprint.
///
/// Returns the new count, or None if the row was reset underneath us.
pub async fn bump_attempt(db: &Db, id: &str, fingerprint: &str) -> Result<Option<u32>> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            "UPDATE papers SET attempt_count = attempt_count + 1, updated_at = ?3
             WHERE id = ?1 AND fingerprint = ?2",
            params![id, fingerprint, now],
        )?;
        if n == 0 {
            return Ok(None);
        }
        let count: i64 = conn.query_row(
            "SELECT attempt_count FROM papers WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(count as u32))
    })
    .await
}

/// Mark a paper failed with its last error, fenced on fingerprint.
pub async fn mark_failed(db: &Db, id: &str, fingerprint: &str, error: &str) -> Result<bool> {
    let id = id.to_string();
    let fingerprint = fingerprint.to_string();
    let error = error.to_string();
    let now = now_rfc3339();
    db.with_connection(move |conn| {
        let n = conn.execute(
            "UPDATE papers SET status = 'failed', last_error = ?3, updated_at = ?4
             WHERE id = ?1 AND fingerprint = ?2",
            params![id, fingerprint, error, now],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Load a full paper row.
pub async fn get_paper(db: &Db, id: &str) -> Result<Option<Paper>> {
    let id = id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, fingerprint, source_path, folder_name, status, attempt_count, last_error,
                   title, authors, journal_name, volume, issue, publication_year, abstract, keywords,
                   markdown,
                   summary, previous_work, hypothesis, distinction, methodology, results, limitations, implications,
                   title_embedding, abstract_embedding,
                   created_at, updated_at
            FROM papers WHERE id = ?1
            "#,
        )?;

        let mut rows = stmt.query_map(params![id], |row| {
            let status: String = row.get(4)?;
            let title: Option<String> = row.get(7)?;
            let authors_json: Option<String> = row.get(8)?;
            let keywords_json: Option<String> = row.get(14)?;

            let metadata = title.map(|title| PaperMetadata {
                title,
                authors: authors_json
                    .as_deref()
                    .and_then(|j| serde_json::from_str(j).ok())
                    .unwrap_or_default(),
                journal_name: row.get(9).ok().flatten(),
                volume: row.get(10).ok().flatten(),
                issue: row.get(11).ok().flatten(),
                year_of_publication: row.get(12).ok().flatten(),
                abstract_text: row.get(13).ok().flatten(),
                keywords: keywords_json
                    .as_deref()
                    .and_then(|j| serde_json::from_str(j).ok())
                    .unwrap_or_default(),
            });

            let summary_text: Option<String> = row.get(16)?;
            let summary = summary_text.map(|summary| PaperSummary {
                summary,
                previous_work: row.get::<_, Option<String>>(17).ok().flatten().unwrap_or_default(),
                hypothesis: row.get::<_, Option<String>>(18).ok().flatten().unwrap_or_default(),
                distinction: row.get::<_, Option<String>>(19).ok().flatten().unwrap_or_default(),
                methodology: row.get::<_, Option<String>>(20).ok().flatten().unwrap_or_default(),
                results: row.get::<_, Option<String>>(21).ok().flatten().unwrap_or_default(),
                limitations: row.get::<_, Option<String>>(22).ok().flatten().unwrap_or_default(),
                implications: row.get::<_, Option<String>>(23).ok().flatten().unwrap_or_default(),
            });

            let title_blob: Option<Vec<u8>> = row.get(24)?;
            let abstract_blob: Option<Vec<u8>> = row.get(25)?;

            Ok(Paper {
                id: row.get(0)?,
                fingerprint: row.get(1)?,
                source_path: row.get(2)?,
                folder_name: row.get(3)?,
                status: parse_status(&status)?,
                attempt_count: row.get::<_, i64>(5)? as u32,
                last_error: row.get(6)?,
                metadata,
                markdown: row.get(15)?,
                summary,
                title_embedding: title_blob.as_deref().and_then(blob_to_embedding),
                abstract_embedding: abstract_blob.as_deref().and_then(blob_to_embedding),
                created_at: row.get(26)?,
                updated_at: row.get(27)?,
            })
        })?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    })
    .await
}

/// Embedding pair of a single paper, if it is fully processed.
pub async fn get_embeddings(db: &Db, id: &str) -> Result<Option<(Vec<f32>, Vec<f32>)>> {
    let id = id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT title_embedding, abstract_embedding FROM papers
             WHERE id = ?1 AND status = 'processed'
             AND title_embedding IS NOT NULL AND abstract_embedding IS NOT NULL",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        match rows.next() {
            Some(row) => {
                let (title_blob, abstract_blob) = row?;
                Ok(blob_to_embedding(&title_blob)
                    .zip(blob_to_embedding(&abstract_blob)))
            }
            None => Ok(None),
        }
    })
    .await
}

/// Load the embedding pairs of all processed papers.
///
/// Only rows with both embeddings present qualify; anything mid-pipeline
/// or failed is invisible to similarity ranking.
pub async fn load_processed_embeddings(db: &Db) -> Result<Vec<EmbeddingRow>> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, title, updated_at, title_embedding, abstract_embedding FROM papers
             WHERE status = 'processed'
             AND title_embedding IS NOT NULL AND abstract_embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, title, updated_at, title_blob, abstract_blob) = row?;
            let (Some(title_embedding), Some(abstract_embedding)) =
                (blob_to_embedding(&title_blob), blob_to_embedding(&abstract_blob))
            else {
                // Unreadable blob: skip rather than poison every ranking call.
                log::warn!("skipping paper {} with malformed embedding blob", id);
                continue;
            };
            out.push(EmbeddingRow {
                id,
                title,
                updated_at,
                title_embedding,
                abstract_embedding,
            });
        }
        Ok(out)
    })
    .await
}

/// Aggregate status counts across the archive.
pub async fn status_counts(db: &Db) -> Result<StatusCounts> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM papers GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            counts.total += n;
            match PaperStatus::parse(&status) {
                Some(PaperStatus::Processed) => counts.processed += n,
                Some(PaperStatus::Pending) => counts.pending += n,
                Some(PaperStatus::Failed) => counts.failed += n,
                Some(s) if s.is_in_progress() => counts.in_progress += n,
                _ => {}
            }
        }
        Ok(counts)
    })
    .await
}

/// Most recently failed papers, newest first.
pub async fn recent_failures(db: &Db, limit: usize) -> Result<Vec<PaperOverview>> {
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM papers WHERE status = 'failed' ORDER BY updated_at DESC LIMIT ?1",
            OVERVIEW_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], overview_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::migrate;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    pub(crate) async fn setup_test_db() -> (Db, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Db::new(&db_path);
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
            .await
            .unwrap();
        (db, temp_dir)
    }

    pub(crate) fn test_file(path: &str) -> FileMetadata {
        FileMetadata {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from(format!("/archive/{}", path)),
            folder_name: path.rsplit_once('/').map(|(d, _)| d.to_string()),
            file_size: 1024,
            modified: std::time::SystemTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_by_fingerprint() {
        let (db, _tmp) = setup_test_db().await;

        let id = insert_paper(&db, &test_file("ml/paper.pdf"), "fp1").await.unwrap();
        let found = find_by_fingerprint(&db, "fp1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, PaperStatus::Pending);
        assert_eq!(found.attempt_count, 0);
        assert_eq!(found.folder_name, Some("ml".to_string()));

        assert!(find_by_fingerprint(&db, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_same_fingerprint_returns_existing_id() {
        let (db, _tmp) = setup_test_db().await;

        let id1 = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();
        let id2 = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_stage_writes_advance_status() {
        let (db, _tmp) = setup_test_db().await;
        let id = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();

        assert!(set_status(&db, &id, "fp1", PaperStatus::Parsing).await.unwrap());
        assert!(store_parse_result(&db, &id, "fp1", "# Title\nBody").await.unwrap());

        let meta = PaperMetadata {
            title: "A study".to_string(),
            authors: vec!["Kim".to_string()],
            abstract_text: Some("We study things.".to_string()),
            ..Default::default()
        };
        assert!(store_metadata(&db, &id, "fp1", &meta).await.unwrap());

        let summary = PaperSummary {
            summary: "s".into(),
            ..Default::default()
        };
        assert!(store_summary(&db, &id, "fp1", &summary).await.unwrap());
        assert!(store_embeddings(&db, &id, "fp1", &[1.0, 0.0], &[0.0, 1.0]).await.unwrap());

        let paper = get_paper(&db, &id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Processed);
        assert_eq!(paper.metadata.as_ref().unwrap().title, "A study");
        assert_eq!(paper.metadata.as_ref().unwrap().authors, vec!["Kim"]);
        assert_eq!(paper.markdown.as_deref(), Some("# Title\nBody"));
        assert_eq!(paper.summary.as_ref().unwrap().summary, "s");
        assert_eq!(paper.title_embedding.as_deref(), Some(&[1.0, 0.0][..]));
        assert_eq!(paper.abstract_embedding.as_deref(), Some(&[0.0, 1.0][..]));
    }

    #[tokio::test]
    async fn test_stage_writes_fenced_on_fingerprint() {
        let (db, _tmp) = setup_test_db().await;
        let id = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();

        // Row reset for a newer file version while a stale worker holds fp1
        reset_for_reprocessing(&db, &id, "fp2").await.unwrap();

        assert!(!store_parse_result(&db, &id, "fp1", "stale").await.unwrap());
        assert!(!store_embeddings(&db, &id, "fp1", &[1.0], &[1.0]).await.unwrap());
        assert!(bump_attempt(&db, &id, "fp1").await.unwrap().is_none());

        let paper = get_paper(&db, &id).await.unwrap().unwrap();
        assert_eq!(paper.status, PaperStatus::Pending);
        assert!(paper.markdown.is_none());
    }

    #[tokio::test]
    async fn test_reset_for_reprocessing_preserves_id_clears_embeddings() {
        let (db, _tmp) = setup_test_db().await;
        let id = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();
        store_embeddings(&db, &id, "fp1", &[1.0], &[1.0]).await.unwrap();

        reset_for_reprocessing(&db, &id, "fp2").await.unwrap();
        let found = find_by_fingerprint(&db, "fp2").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, PaperStatus::Pending);
        assert_eq!(found.attempt_count, 0);
        assert!(load_processed_embeddings(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bump_attempt_and_mark_failed() {
        let (db, _tmp) = setup_test_db().await;
        let id = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();

        assert_eq!(bump_attempt(&db, &id, "fp1").await.unwrap(), Some(1));
        assert_eq!(bump_attempt(&db, &id, "fp1").await.unwrap(), Some(2));

        assert!(mark_failed(&db, &id, "fp1", "chat: HTTP 503").await.unwrap());
        let found = find_by_fingerprint(&db, "fp1").await.unwrap().unwrap();
        assert_eq!(found.status, PaperStatus::Failed);
        assert_eq!(found.last_error.as_deref(), Some("chat: HTTP 503"));

        let failures = recent_failures(&db, 10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, id);
    }

    #[tokio::test]
    async fn test_reset_failed_only_from_failed() {
        let (db, _tmp) = setup_test_db().await;
        let id = insert_paper(&db, &test_file("a.pdf"), "fp1").await.unwrap();

        // Pending paper cannot be "retried"
        assert!(!reset_failed(&db, &id).await.unwrap());

        mark_failed(&db, &id, "fp1", "boom").await.unwrap();
        assert!(reset_failed(&db, &id).await.unwrap());

        let found = find_by_fingerprint(&db, "fp1").await.unwrap().unwrap();
        assert_eq!(found.status, PaperStatus::Pending);
        assert_eq!(found.attempt_count, 0);
        assert!(found.last_error.is_none());
    }

    #[tokio::test]
    async fn test_load_processed_embeddings_filters_unfinished() {
        let (db, _tmp) = setup_test_db().await;

        let done = insert_paper(&db, &test_file("done.pdf"), "fp_done").await.unwrap();
        store_embeddings(&db, &done, "fp_done", &[1.0, 0.0], &[0.0, 1.0]).await.unwrap();

        let pending = insert_paper(&db, &test_file("pending.pdf"), "fp_pending").await.unwrap();
        let failed = insert_paper(&db, &test_file("failed.pdf"), "fp_failed").await.unwrap();
        mark_failed(&db, &failed, "fp_failed", "x").await.unwrap();

        let rows = load_processed_embeddings(&db).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, done);
        assert_eq!(rows[0].title_embedding, vec![1.0, 0.0]);

        let counts = status_counts(&db).await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.processed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);

        assert!(get_embeddings(&db, &done).await.unwrap().is_some());
        assert!(get_embeddings(&db, &pending).await.unwrap().is_none());
    }

    #[test]
    fn test_blob_codec() {
        let vec = vec![1.0f32, -0.5, 3.25];
        let blob = embedding_to_blob(&vec);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_embedding(&blob), Some(vec));

        // Truncated blob is rejected
        assert_eq!(blob_to_embedding(&[0u8, 1, 2]), None);
    }
}
