use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Upload validation limits and the directory uploaded bytes are copied to.
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_max_files_per_project")]
    pub max_files_per_project: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: i64,
    #[serde(default = "default_max_project_bytes")]
    pub max_project_bytes: i64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_files_per_project: default_max_files_per_project(),
            max_file_bytes: default_max_file_bytes(),
            max_project_bytes: default_max_project_bytes(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data/files")
}
fn default_max_files_per_project() -> usize {
    100
}
fn default_max_file_bytes() -> i64 {
    50 * 1024 * 1024
}
fn default_max_project_bytes() -> i64 {
    500 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_window_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"remote"` for an OpenAI-compatible HTTP API, `"hash"` for the
    /// deterministic offline embedder.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_weight_similarity")]
    pub weight_similarity: f64,
    #[serde(default = "default_weight_text")]
    pub weight_text_match: f64,
    #[serde(default = "default_weight_recency")]
    pub weight_recency: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_threshold(),
            default_limit: default_limit(),
            weight_similarity: default_weight_similarity(),
            weight_text_match: default_weight_text(),
            weight_recency: default_weight_recency(),
        }
    }
}

fn default_threshold() -> f64 {
    0.7
}
fn default_limit() -> usize {
    10
}
fn default_weight_similarity() -> f64 {
    0.6
}
fn default_weight_text() -> f64 {
    0.3
}
fn default_weight_recency() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Hard cap on simultaneously processing files.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempt cap before a file moves to `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff (`base * 2^(attempt-1)`).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.window_chars == 0 {
        anyhow::bail!("chunking.window_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.window_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.window_chars");
    }

    if config.retrieval.default_limit < 1 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "remote" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be remote or hash.",
            other
        ),
    }

    if config.queue.concurrency == 0 {
        anyhow::bail!("queue.concurrency must be >= 1");
    }
    if config.queue.max_attempts == 0 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }

    Ok(())
}
