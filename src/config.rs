use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub pipeline: PipelineConfig,
    pub extraction: ExtractionConfig,
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Archive location and persistence paths
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory watched for research-paper PDFs.
    pub root: PathBuf,
    pub db_path: PathBuf,
    /// Interval between reconciliation scans while serving.
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Worker pool size; bounds concurrent calls against the external services.
    pub workers: usize,
    /// Intake queue depth; scan submissions block when full, watcher submissions drop.
    pub queue_depth: usize,
    /// Attempt ceiling for transiently failing documents.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// Per-stage call timeout; exceeding it counts as a transient failure.
    pub stage_timeout_secs: u64,
    /// Watcher debounce window for rapid events on the same path.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// External parser + LLM service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// PDF-to-markdown parser service endpoint.
    pub parser_url: String,
    /// Ollama-compatible API base URL for metadata/summary/embedding calls.
    pub llm_url: String,
    pub llm_model: String,
    pub embed_model: String,
    pub embedding_dimensions: usize,
    #[serde(default = "default_query_cache_capacity")]
    pub query_cache_capacity: usize,
}

/// Similarity ranking defaults
#[derive(Debug, Clone, Deserialize)]
pub struct SimilarityConfig {
    pub title_weight: f32,
    pub abstract_weight: f32,
    pub default_limit: usize,
    pub min_score: f32,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            port: default_http_port(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_rescan_interval_secs() -> u64 {
    900
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_query_cache_capacity() -> usize {
    256
}

fn default_http_enabled() -> bool {
    false
}

fn default_http_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in PAPERFLOW_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignore errors - file is optional)
        let _ = dotenv::dotenv();

        let config_path = std::env::var("PAPERFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .context("Failed to parse config.toml")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// A bad archive root or invalid weights is fatal at startup; the process
    /// must not begin watching with a configuration it cannot honor.
    fn validate(&self) -> Result<()> {
        if !self.archive.root.exists() {
            anyhow::bail!(
                "archive root does not exist: {}. Set archive.root in config.toml to your PDF directory.",
                self.archive.root.display()
            );
        }

        if !self.archive.root.is_dir() {
            anyhow::bail!(
                "archive root must be a directory, not a file: {}",
                self.archive.root.display()
            );
        }

        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be greater than 0");
        }

        if self.pipeline.queue_depth == 0 {
            anyhow::bail!("pipeline.queue_depth must be greater than 0");
        }

        if self.pipeline.max_attempts == 0 {
            anyhow::bail!("pipeline.max_attempts must be greater than 0");
        }

        if self.pipeline.backoff_ceiling_ms < self.pipeline.backoff_base_ms {
            anyhow::bail!("pipeline.backoff_ceiling_ms must be >= pipeline.backoff_base_ms");
        }

        if self.pipeline.stage_timeout_secs == 0 {
            anyhow::bail!("pipeline.stage_timeout_secs must be greater than 0");
        }

        for (name, w) in [
            ("similarity.title_weight", self.similarity.title_weight),
            ("similarity.abstract_weight", self.similarity.abstract_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }

        if self.similarity.title_weight + self.similarity.abstract_weight <= 0.0 {
            anyhow::bail!("similarity weights must not both be zero");
        }

        if self.similarity.min_score < 0.0 || self.similarity.min_score > 1.0 {
            anyhow::bail!("similarity.min_score must be between 0.0 and 1.0");
        }

        if self.similarity.default_limit == 0 {
            anyhow::bail!("similarity.default_limit must be greater than 0");
        }

        if self.extraction.embedding_dimensions == 0 {
            anyhow::bail!("extraction.embedding_dimensions must be greater than 0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.archive.db_path
    }

    /// Get the archive root path
    pub fn archive_root(&self) -> &Path {
        &self.archive.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide cwd and env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn create_test_config(temp_dir: &TempDir) -> String {
        let root = temp_dir.path().canonicalize().unwrap();
        let root_str = root.to_str().unwrap().replace('\\', "\\\\");
        format!(
            r#"
[archive]
root = "{}"
db_path = "./test.db"
log_level = "debug"

[pipeline]
workers = 3
queue_depth = 64
max_attempts = 4
backoff_base_ms = 500
backoff_ceiling_ms = 30000
stage_timeout_secs = 120

[extraction]
parser_url = "http://localhost:8111/convert"
llm_url = "http://localhost:11434"
llm_model = "qwen3:14b"
embed_model = "nomic-embed-text"
embedding_dimensions = 768

[similarity]
title_weight = 0.75
abstract_weight = 0.25
default_limit = 5
min_score = 0.5
"#,
            root_str
        )
    }

    /// Restores cwd when dropped (e.g. on panic).
    struct CwdGuard(std::path::PathBuf);
    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.0);
        }
    }

    fn with_config_env(config_path: &std::path::Path, f: impl FnOnce()) {
        let original = std::env::var("PAPERFLOW_CONFIG").ok();
        std::env::set_var("PAPERFLOW_CONFIG", config_path.to_str().unwrap());
        f();
        std::env::remove_var("PAPERFLOW_CONFIG");
        if let Some(val) = original {
            std::env::set_var("PAPERFLOW_CONFIG", val);
        }
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_content = create_test_config(&temp_dir);
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, config_content).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir.clone());
        std::env::set_current_dir(temp_dir.path()).unwrap();
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.archive.log_level, "debug");
            assert_eq!(config.pipeline.workers, 3);
            assert_eq!(config.pipeline.max_attempts, 4);
            assert_eq!(config.similarity.default_limit, 5);
            // defaults fill in
            assert_eq!(config.pipeline.debounce_ms, 500);
            assert!(!config.http.enabled);
        });
    }

    #[test]
    fn test_config_invalid_weights() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_content = create_test_config(&temp_dir)
            .replace("title_weight = 0.75", "title_weight = 1.5");
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, config_content).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config
                .unwrap_err()
                .to_string()
                .contains("title_weight"));
        });
    }

    #[test]
    fn test_config_zero_workers_rejected() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_content =
            create_test_config(&temp_dir).replace("workers = 3", "workers = 0");
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, config_content).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config.unwrap_err().to_string().contains("workers"));
        });
    }

    #[test]
    fn test_config_backoff_ceiling_below_base_rejected() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_content = create_test_config(&temp_dir)
            .replace("backoff_ceiling_ms = 30000", "backoff_ceiling_ms = 100");
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, config_content).unwrap();
        let config_path = config_path.canonicalize().unwrap();
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_err());
            assert!(config.unwrap_err().to_string().contains("backoff_ceiling_ms"));
        });
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("PAPERFLOW_CONFIG").ok();
        std::env::set_var("PAPERFLOW_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("PAPERFLOW_CONFIG");
        if let Some(v) = original {
            std::env::set_var("PAPERFLOW_CONFIG", v);
        }
    }
}
