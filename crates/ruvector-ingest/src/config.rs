//! Configuration for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Main ingestion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Work queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// Task executor configuration
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Task decomposition configuration
    #[serde(default)]
    pub decompose: DecomposeConfig,
    /// Ollama/LLM configuration
    #[serde(default)]
    pub llm: LlmConfig,
    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,
}

impl IngestConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `MAX_CONTENT_LENGTH`, `REDIS_URL` and `OLLAMA_BASE_URL`
    pub fn apply_env_overrides(&mut self) {
        if let Some(limit) = std::env::var("MAX_CONTENT_LENGTH")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.worker.max_content_length = limit;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.queue.backend = QueueBackend::Redis;
                self.queue.redis_url = url;
            }
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            if !url.trim().is_empty() {
                self.llm.base_url = url;
            }
        }
    }
}

/// Queue backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process queue (single worker, tests)
    #[default]
    Memory,
    /// Redis Streams with a consumer group
    Redis,
}

/// Work queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Stream (topic) name
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Consumer group name
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Messages older than this are trimmed from the stream
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Approximate stream length cap
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_queue_name() -> String { "ruvector_ingest_svr_queue".to_string() }
fn default_consumer_group() -> String { "ruvector_ingest_svr_task_broker".to_string() }
fn default_retention_secs() -> u64 { 3600 }
fn default_max_len() -> usize { 1024 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            redis_url: default_redis_url(),
            queue_name: default_queue_name(),
            consumer_group: default_consumer_group(),
            retention_secs: default_retention_secs(),
            max_len: default_max_len(),
        }
    }
}

/// Task executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between empty claims (default: 1s)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Heartbeat period (default: 30s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeat records older than this are dropped (default: 30 min)
    #[serde(default = "default_heartbeat_expiry")]
    pub heartbeat_expiry_secs: u64,
    /// Claims beyond this count abandon the task
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum document size accepted by the chunk builder (default: 128MB)
    #[serde(default = "default_max_content_length")]
    pub max_content_length: u64,
    /// Chunks written per document store insert
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    /// Texts per embedding request
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    /// Store progress is reported every N chunks
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    /// Weight of the title vector when it is absent from parser config
    #[serde(default = "default_filename_embd_weight")]
    pub filename_embd_weight: f32,
    /// Period of the document progress sync (default: 3s)
    #[serde(default = "default_progress_sync_interval")]
    pub progress_sync_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_heartbeat_expiry() -> u64 { 30 * 60 }
fn default_max_retries() -> u32 { 3 }
fn default_max_content_length() -> u64 { 128 * 1024 * 1024 } // 128MB
fn default_insert_batch_size() -> usize { 4 }
fn default_embed_batch_size() -> usize { 16 }
fn default_progress_every() -> usize { 128 }
fn default_filename_embd_weight() -> f32 { 0.1 }
fn default_progress_sync_interval() -> u64 { 3 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_expiry_secs: default_heartbeat_expiry(),
            max_retries: default_max_retries(),
            max_content_length: default_max_content_length(),
            insert_batch_size: default_insert_batch_size(),
            embed_batch_size: default_embed_batch_size(),
            progress_every: default_progress_every(),
            filename_embd_weight: default_filename_embd_weight(),
            progress_sync_interval_secs: default_progress_sync_interval(),
        }
    }
}

/// Task decomposition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeConfig {
    /// Pages per PDF work unit
    #[serde(default = "default_task_page_size")]
    pub task_page_size: u32,
    /// Pages per PDF work unit for the `paper` parser
    #[serde(default = "default_paper_page_size")]
    pub paper_page_size: u32,
    /// Rows per spreadsheet work unit
    #[serde(default = "default_table_rows")]
    pub table_rows_per_task: u32,
}

fn default_task_page_size() -> u32 { 12 }
fn default_paper_page_size() -> u32 { 22 }
fn default_table_rows() -> u32 { 3000 }

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            task_page_size: default_task_page_size(),
            paper_page_size: default_paper_page_size(),
            table_rows_per_task: default_table_rows(),
        }
    }
}

/// LLM (Ollama) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Embedding model used when a knowledge base names none
    pub embed_model: String,
    /// Chat model used when a tenant names none
    pub chat_model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Number of retries for failed requests
    pub max_retries: u32,
    /// Context window size (tokens)
    pub context_size: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            chat_model: "llama3.2:3b".to_string(),
            timeout_secs: 120,
            max_retries: 2,
            context_size: 8192,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Metadata database (tenants, knowledge bases, documents, tasks)
    pub database_path: PathBuf,
    /// Chunk index database
    pub doc_store_path: PathBuf,
    /// Root directory of the blob store
    pub blob_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ruvector-ingest");

        Self {
            database_path: base.join("metadata.db"),
            doc_store_path: base.join("chunks.db"),
            blob_root: base.join("blobs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.queue.retention_secs, 3600);
        assert_eq!(config.queue.max_len, 1024);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.worker.max_content_length, 128 * 1024 * 1024);
        assert_eq!(config.decompose.task_page_size, 12);
        assert_eq!(config.decompose.paper_page_size, 22);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [queue]
            backend = "redis"
            queue_name = "custom_queue"

            [worker]
            insert_batch_size = 8
        "#;
        let config: IngestConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.queue.backend, QueueBackend::Redis);
        assert_eq!(config.queue.queue_name, "custom_queue");
        assert_eq!(config.queue.consumer_group, "ruvector_ingest_svr_task_broker");
        assert_eq!(config.worker.insert_batch_size, 8);
        assert_eq!(config.worker.embed_batch_size, 16);
        assert_eq!(config.decompose.table_rows_per_task, 3000);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(&path, "[decompose]\ntask_page_size = 5\n").unwrap();
        let config = IngestConfig::from_file(&path).unwrap();
        assert_eq!(config.decompose.task_page_size, 5);

        assert!(IngestConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
