use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::search::ranker::{ChunkAggregation, RankingOptions};

/// Main configuration structure
///
/// Every section is optional in the TOML file; missing keys take the
/// defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Database location and logging
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

/// Mutation queue settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            submit_timeout_secs: default_submit_timeout_secs(),
        }
    }
}

/// Background scan-and-load loop
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
    /// Pause between drained items so the writer is not monopolized
    #[serde(default = "default_item_pause_ms")]
    pub item_pause_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
            item_pause_ms: default_item_pause_ms(),
        }
    }
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    /// "openai" or "hashing"
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Chunks beyond this many are dropped before vectorization
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            batch_size: default_batch_size(),
            dimensions: default_dimensions(),
            cache_capacity: default_cache_capacity(),
            max_chunks: default_max_chunks(),
        }
    }
}

/// Retrieval ranking configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_chunk_weight")]
    pub chunk_weight: f32,
    #[serde(default = "default_filename_weight")]
    pub filename_weight: f32,
    #[serde(default = "default_chunk_aggregation")]
    pub chunk_aggregation: String,
    #[serde(default = "default_top_k_chunks")]
    pub top_k_chunks: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_high_score")]
    pub high_score: f32,
    #[serde(default = "default_min_docs")]
    pub min_docs: usize,
    #[serde(default = "default_max_docs")]
    pub max_docs: usize,
    #[serde(default = "default_context_budget_chars")]
    pub context_budget_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            chunk_weight: default_chunk_weight(),
            filename_weight: default_filename_weight(),
            chunk_aggregation: default_chunk_aggregation(),
            top_k_chunks: default_top_k_chunks(),
            min_score: default_min_score(),
            high_score: default_high_score(),
            min_docs: default_min_docs(),
            max_docs: default_max_docs(),
            context_budget_chars: default_context_budget_chars(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("kbvault.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_submit_timeout_secs() -> u64 {
    30
}

fn default_scan_interval_secs() -> u64 {
    5
}

fn default_item_pause_ms() -> u64 {
    10
}

fn default_provider() -> String {
    "hashing".to_string()
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_dimensions() -> usize {
    384
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_max_chunks() -> usize {
    100
}

fn default_top_n() -> usize {
    90
}

fn default_chunk_weight() -> f32 {
    0.7
}

fn default_filename_weight() -> f32 {
    0.3
}

fn default_chunk_aggregation() -> String {
    "weighted_max".to_string()
}

fn default_top_k_chunks() -> usize {
    3
}

fn default_min_score() -> f32 {
    0.6
}

fn default_high_score() -> f32 {
    0.75
}

fn default_min_docs() -> usize {
    5
}

fn default_max_docs() -> usize {
    10
}

fn default_context_budget_chars() -> usize {
    45_000
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for the config file in this order:
    /// 1. Path specified in KBVAULT_CONFIG environment variable (must exist)
    /// 2. ./config.toml in current directory (defaults are used when absent)
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config = match std::env::var("KBVAULT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let path = PathBuf::from("config.toml");
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    log::debug!("No config.toml found, using defaults");
                    Config::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.embeddings.provider.as_str() {
            "openai" => {
                std::env::var(&self.embeddings.api_key_env).with_context(|| {
                    format!(
                        "Environment variable {} not set. Set it in your .env file or switch embeddings.provider to \"hashing\".",
                        self.embeddings.api_key_env
                    )
                })?;
            }
            "hashing" => {}
            other => anyhow::bail!("Unknown embeddings.provider: {}", other),
        }

        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }
        if self.embeddings.batch_size == 0 {
            anyhow::bail!("embeddings.batch_size must be greater than 0");
        }
        if self.embeddings.max_chunks == 0 {
            anyhow::bail!("embeddings.max_chunks must be greater than 0");
        }

        let search = &self.search;
        if search.top_n == 0 {
            anyhow::bail!("search.top_n must be greater than 0");
        }
        if search.chunk_weight < 0.0 || search.filename_weight < 0.0 {
            anyhow::bail!("search weights must not be negative");
        }
        for (name, value) in [
            ("search.min_score", search.min_score),
            ("search.high_score", search.high_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }
        if search.max_docs == 0 || search.max_docs < search.min_docs {
            anyhow::bail!("search.max_docs must be at least search.min_docs and greater than 0");
        }
        ChunkAggregation::parse(&search.chunk_aggregation)
            .with_context(|| format!("Invalid search.chunk_aggregation: {}", search.chunk_aggregation))?;

        if self.queue.submit_timeout_secs == 0 {
            anyhow::bail!("queue.submit_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.storage.db_path
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.submit_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan.interval_secs)
    }

    pub fn item_pause(&self) -> Duration {
        Duration::from_millis(self.scan.item_pause_ms)
    }

    /// Ranking options derived from `[search]`; call after `validate`.
    pub fn ranking_options(&self) -> RankingOptions {
        let search = &self.search;
        RankingOptions {
            chunk_weight: search.chunk_weight,
            filename_weight: search.filename_weight,
            aggregation: ChunkAggregation::parse(&search.chunk_aggregation)
                .unwrap_or(ChunkAggregation::WeightedMax),
            top_k_chunks: search.top_k_chunks,
            min_score: search.min_score,
            high_score: search.high_score,
            min_docs: search.min_docs,
            max_docs: search.max_docs,
        }
    }
}
