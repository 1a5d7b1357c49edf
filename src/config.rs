use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub features: FeaturesConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory where uploaded blobs are stored, keyed by content hash.
    pub blob_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Attempt budget per stage before a retryable failure escalates.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Per-stage timeout; exceeding it counts as a retryable failure.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Queue lease duration: the per-content-hash fence.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            workers: default_workers(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_stage_timeout_secs() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_lease_secs() -> u64 {
    60
}
fn default_workers() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeaturesConfig {
    /// Identifies the extractor configuration; cached vectors are only
    /// compatible with themselves.
    pub version: String,
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
}

fn default_min_token_len() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Version of the trained snapshot this deployment classifies with.
    pub version: String,
    /// Path to the JSON model snapshot.
    pub path: PathBuf,
    /// Results below this confidence are flagged needs_review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
}

fn default_review_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_parsed_capacity")]
    pub parsed_capacity: usize,
    #[serde(default = "default_feature_capacity")]
    pub feature_capacity: usize,
    #[serde(default = "default_classification_capacity")]
    pub classification_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            parsed_capacity: default_parsed_capacity(),
            feature_capacity: default_feature_capacity(),
            classification_capacity: default_classification_capacity(),
        }
    }
}

fn default_parsed_capacity() -> usize {
    256
}
fn default_feature_capacity() -> usize {
    1024
}
fn default_classification_capacity() -> usize {
    4096
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.max_attempts == 0 {
        anyhow::bail!("pipeline.max_attempts must be >= 1");
    }
    if config.pipeline.backoff_base_ms == 0 {
        anyhow::bail!("pipeline.backoff_base_ms must be > 0");
    }
    if config.pipeline.backoff_cap_ms < config.pipeline.backoff_base_ms {
        anyhow::bail!("pipeline.backoff_cap_ms must be >= pipeline.backoff_base_ms");
    }
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }
    if config.features.version.trim().is_empty() {
        anyhow::bail!("features.version must not be empty");
    }
    if config.model.version.trim().is_empty() {
        anyhow::bail!("model.version must not be empty");
    }
    if !(0.0..=1.0).contains(&config.model.review_threshold) {
        anyhow::bail!("model.review_threshold must be in [0.0, 1.0]");
    }
    if config.cache.parsed_capacity == 0
        || config.cache.feature_capacity == 0
        || config.cache.classification_capacity == 0
    {
        anyhow::bail!("cache capacities must be > 0");
    }
    if config.storage.max_upload_bytes == 0 {
        anyhow::bail!("storage.max_upload_bytes must be > 0");
    }
    Ok(())
}
