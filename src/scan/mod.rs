//! Archive scanning: fingerprinting and recursive PDF discovery.
//!
//! The scanner is the reconciliation path: it produces a point-in-time
//! snapshot of the archive at startup and on a periodic interval, catching
//! anything the watcher missed (e.g. files dropped during a restart window).

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{PaperflowError, Result};

/// Suffixes of partially-written files that editors and browsers leave
/// behind; submitting one would waste a pipeline run on garbage.
const TEMP_SUFFIXES: &[&str] = &["~", ".tmp", ".part", ".crdownload", ".swp"];

/// Metadata for a discovered PDF
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    /// Archive subdirectory the paper lives in, `None` for root-level files.
    pub folder_name: Option<String>,
    pub file_size: u64,
    pub modified: std::time::SystemTime,
}

/// Compute the content fingerprint of a file: SHA-256 over its bytes.
///
/// Content-based (not path + mtime) so renames and metadata-only touches
/// never trigger reprocessing, while any byte change does.
pub fn compute_fingerprint(path: &Path) -> Result<String> {
    let content = std::fs::read(path).map_err(PaperflowError::Io)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_temp_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    TEMP_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

fn folder_name_of(relative_path: &str) -> Option<String> {
    let normalized = relative_path.replace('\\', "/");
    match normalized.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent.to_string()),
        _ => None,
    }
}

/// Discover all PDF files under the archive root.
///
/// Recursive, symlinks not followed (avoids cycles), hidden entries and
/// partial-write temp files excluded. Pure function of the filesystem at
/// call time, so it is restartable.
pub fn discover_pdfs(root: &Path) -> Result<Vec<FileMetadata>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            // Keep the root itself; prune hidden directories and files.
            e.depth() == 0
                || e.file_name()
                    .to_str()
                    .map(|n| !is_hidden(n))
                    .unwrap_or(false)
        })
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !entry.file_type().is_file() || !is_pdf(path) {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if is_temp_file(&name) {
            continue;
        }

        let metadata = std::fs::metadata(path).map_err(PaperflowError::Io)?;

        let relative_path = path
            .strip_prefix(root)
            .map_err(|_| {
                PaperflowError::Config(format!(
                    "Failed to compute relative path for: {}",
                    path.display()
                ))
            })?
            .to_string_lossy()
            .replace('\\', "/");

        files.push(FileMetadata {
            folder_name: folder_name_of(&relative_path),
            relative_path,
            absolute_path: path.to_path_buf(),
            file_size: metadata.len(),
            modified: metadata.modified().map_err(PaperflowError::Io)?,
        });
    }

    log::info!("Discovered {} PDFs in {}", files.len(), root.display());
    Ok(files)
}

/// Build FileMetadata from an absolute path and the archive root.
///
/// Returns None if the path is outside the root, not a PDF, a temp file,
/// or no longer a regular file (deleted between event and processing).
pub fn file_metadata_from_path(absolute_path: &Path, root: &Path) -> Result<Option<FileMetadata>> {
    let root = root
        .canonicalize()
        .map_err(|e| PaperflowError::Config(format!("root canonicalize: {}", e)))?;
    let absolute_path = match absolute_path.canonicalize() {
        Ok(p) => p,
        // The file vanished before we got to it; the next scan reconciles.
        Err(_) => return Ok(None),
    };

    if !absolute_path.starts_with(&root) {
        return Ok(None);
    }

    if !is_pdf(&absolute_path) {
        return Ok(None);
    }

    let name = absolute_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if is_hidden(&name) || is_temp_file(&name) {
        return Ok(None);
    }

    if !absolute_path.is_file() {
        return Ok(None);
    }

    let relative_path = absolute_path
        .strip_prefix(&root)
        .map_err(|_| PaperflowError::Config("strip_prefix".to_string()))?
        .to_string_lossy()
        .replace('\\', "/");

    let metadata = std::fs::metadata(&absolute_path).map_err(PaperflowError::Io)?;
    Ok(Some(FileMetadata {
        folder_name: folder_name_of(&relative_path),
        relative_path,
        absolute_path,
        file_size: metadata.len(),
        modified: metadata.modified().map_err(PaperflowError::Io)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compute_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("paper.pdf");
        fs::write(&file_path, b"%PDF-1.4 content").unwrap();

        let fp = compute_fingerprint(&file_path).unwrap();
        assert_eq!(fp.len(), 64); // SHA-256 produces 64 hex chars

        // Same content, same fingerprint
        assert_eq!(fp, compute_fingerprint(&file_path).unwrap());

        // Changed content, different fingerprint
        fs::write(&file_path, b"%PDF-1.4 different").unwrap();
        assert_ne!(fp, compute_fingerprint(&file_path).unwrap());
    }

    #[test]
    fn test_discover_pdfs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::create_dir_all(root.join("neuroscience/2024")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("intro.pdf"), "%PDF").unwrap();
        fs::write(root.join("notes.txt"), "not a pdf").unwrap();
        fs::write(root.join("neuroscience/review.PDF"), "%PDF").unwrap();
        fs::write(root.join("neuroscience/2024/study.pdf"), "%PDF").unwrap();
        fs::write(root.join("neuroscience/draft.pdf.part"), "partial").unwrap();
        fs::write(root.join(".hidden.pdf"), "%PDF").unwrap();
        fs::write(root.join(".git/object.pdf"), "%PDF").unwrap();

        let mut files = discover_pdfs(root).unwrap();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "intro.pdf",
                "neuroscience/2024/study.pdf",
                "neuroscience/review.PDF",
            ]
        );

        assert_eq!(files[0].folder_name, None);
        assert_eq!(files[1].folder_name, Some("neuroscience/2024".to_string()));
        assert_eq!(files[2].folder_name, Some("neuroscience".to_string()));
    }

    #[test]
    fn test_discover_pdfs_empty() {
        let temp_dir = TempDir::new().unwrap();
        let files = discover_pdfs(temp_dir.path()).unwrap();
        assert_eq!(files.len(), 0);
    }

    #[test]
    fn test_file_metadata_from_path_under_root() {
        let root = TempDir::new().unwrap();
        let sub = root.path().join("physics");
        fs::create_dir_all(&sub).unwrap();
        let file_path = sub.join("paper.pdf");
        fs::write(&file_path, "%PDF").unwrap();

        let meta = file_metadata_from_path(&file_path, root.path()).unwrap();
        let meta = meta.expect("expected Some(FileMetadata)");
        assert_eq!(meta.relative_path, "physics/paper.pdf");
        assert_eq!(meta.folder_name, Some("physics".to_string()));
        assert!(meta.file_size > 0);
    }

    #[test]
    fn test_file_metadata_from_path_outside_root_returns_none() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let file_path = other.path().join("paper.pdf");
        fs::write(&file_path, "%PDF").unwrap();

        let meta = file_metadata_from_path(&file_path, root.path()).unwrap();
        assert!(meta.is_none());
    }

    #[test]
    fn test_file_metadata_from_path_rejects_non_pdf_and_temp() {
        let root = TempDir::new().unwrap();
        let txt = root.path().join("readme.txt");
        fs::write(&txt, "text").unwrap();
        assert!(file_metadata_from_path(&txt, root.path()).unwrap().is_none());

        let partial = root.path().join("download.pdf.crdownload");
        fs::write(&partial, "partial").unwrap();
        assert!(file_metadata_from_path(&partial, root.path()).unwrap().is_none());
    }

    #[test]
    fn test_file_metadata_from_path_vanished_file_returns_none() {
        let root = TempDir::new().unwrap();
        let gone = root.path().join("gone.pdf");
        let meta = file_metadata_from_path(&gone, root.path()).unwrap();
        assert!(meta.is_none());
    }
}
