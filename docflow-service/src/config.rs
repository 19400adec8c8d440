//! Service configuration.
//!
//! Loaded once at startup from an optional `config.toml` and `DOCFLOW__*`
//! environment variables. Every field has a default so an empty
//! environment yields a runnable service.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::{BackoffPolicy, RetryPolicy, Stage};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub engines: EnginesConfig,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from `config.toml` (optional) and the environment.
    pub fn load() -> ServiceResult<Self> {
        Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("DOCFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("docflow.db")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Durable task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default redelivery budget for newly enqueued tasks
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Base delay for queue-level redelivery; the n-th retry waits `base * factor^n`
    #[serde(default = "default_queue_retry_base_secs")]
    pub retry_base_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub retry_factor: f64,

    #[serde(default = "default_queue_retry_max_secs")]
    pub retry_max_secs: u64,

    /// Terminal tasks older than this are removed by the cleanup loop
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// A `processing` claim older than this is considered abandoned
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl QueueConfig {
    pub fn retry_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.retry_base_secs),
            self.retry_factor,
            Duration::from_secs(self.retry_max_secs),
        )
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Never zero; `tokio::time::interval` rejects a zero period
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            retry_base_secs: default_queue_retry_base_secs(),
            retry_factor: default_backoff_factor(),
            retry_max_secs: default_queue_retry_max_secs(),
            retention_days: default_retention_days(),
            lease_timeout_secs: default_lease_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle time between polls when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause after the queue store itself fails
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

/// In-process retry budget for one pipeline stage. Unset fields fall back
/// to the stage's own default budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRetryConfig {
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub base_delay_ms: Option<u64>,

    #[serde(default)]
    pub backoff_factor: Option<f64>,

    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl StageRetryConfig {
    fn policy(&self, stage: Stage) -> RetryPolicy {
        let (max_retries, base_delay_ms) = default_stage_budget(stage);
        let max_delay_ms = self.max_delay_ms.unwrap_or_else(default_stage_max_delay_ms);
        RetryPolicy::new(
            self.max_retries.unwrap_or(max_retries),
            BackoffPolicy::new(
                Duration::from_millis(self.base_delay_ms.unwrap_or(base_delay_ms)),
                self.backoff_factor.unwrap_or_else(default_backoff_factor),
                Duration::from_millis(max_delay_ms),
            ),
        )
    }
}

/// Pipeline orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Documents with at least this many recorded failures are skipped
    #[serde(default = "default_skip_threshold")]
    pub skip_threshold: u32,

    /// Deadline for a single stage attempt
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    #[serde(default)]
    pub parsing: StageRetryConfig,

    #[serde(default)]
    pub chunking: StageRetryConfig,

    #[serde(default)]
    pub embedding: StageRetryConfig,

    #[serde(default)]
    pub storing: StageRetryConfig,
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn retry_policy(&self, stage: Stage) -> RetryPolicy {
        match stage {
            Stage::Parsing => self.parsing.policy(stage),
            Stage::Chunking => self.chunking.policy(stage),
            Stage::Embedding => self.embedding.policy(stage),
            Stage::Storing => self.storing.policy(stage),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_threshold: default_skip_threshold(),
            stage_timeout_secs: default_stage_timeout_secs(),
            parsing: StageRetryConfig::default(),
            chunking: StageRetryConfig::default(),
            embedding: StageRetryConfig::default(),
            storing: StageRetryConfig::default(),
        }
    }
}

/// Selection of stage engines by registry name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default = "default_parser")]
    pub parser: String,

    #[serde(default = "default_chunker")]
    pub chunker: String,

    #[serde(default = "default_embedder")]
    pub embedder: String,

    #[serde(default = "default_store")]
    pub store: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            parser: default_parser(),
            chunker: default_chunker(),
            embedder: default_embedder(),
            store: default_store(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

/// Ollama embedding endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            embedding_model: default_embedding_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact human format
    #[serde(default)]
    pub json: bool,
}

// ==================== Default Value Functions ====================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_upload_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_queue_retry_base_secs() -> u64 {
    60
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_queue_retry_max_secs() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    7
}

fn default_lease_timeout_secs() -> u64 {
    1800
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_concurrency() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_error_backoff_secs() -> u64 {
    5
}

fn default_stage_max_delay_ms() -> u64 {
    60_000
}

fn default_skip_threshold() -> u32 {
    5
}

fn default_stage_timeout_secs() -> u64 {
    600
}

/// `(max_retries, base_delay_ms)` per stage. Embedding talks to an
/// external model server and gets the largest budget.
fn default_stage_budget(stage: Stage) -> (u32, u64) {
    match stage {
        Stage::Parsing => (2, 1000),
        Stage::Chunking => (2, 500),
        Stage::Embedding => (3, 2000),
        Stage::Storing => (2, 1000),
    }
}

fn default_parser() -> String {
    "text".to_string()
}

fn default_chunker() -> String {
    "fixed".to_string()
}

fn default_embedder() -> String {
    "ollama".to_string()
}

fn default_store() -> String {
    "sqlite".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    100
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_budgets_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry_policy(Stage::Parsing).max_retries, 2);
        assert_eq!(config.retry_policy(Stage::Chunking).max_retries, 2);
        assert_eq!(config.retry_policy(Stage::Embedding).max_retries, 3);
        assert_eq!(config.retry_policy(Stage::Storing).max_retries, 2);

        assert_eq!(
            config.retry_policy(Stage::Chunking).backoff.delay(0),
            Duration::from_millis(500)
        );
        assert_eq!(
            config.retry_policy(Stage::Embedding).backoff.delay(1),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_partial_stage_override_keeps_stage_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"embedding":{"max_retries":5}}"#).unwrap();
        let embedding = config.retry_policy(Stage::Embedding);
        assert_eq!(embedding.max_retries, 5);
        assert_eq!(embedding.backoff.delay(0), Duration::from_millis(2000));
        assert_eq!(config.retry_policy(Stage::Parsing).max_retries, 2);

        let config: AppConfig = Config::builder()
            .set_override("pipeline.chunking.base_delay_ms", 50)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let chunking = config.pipeline.retry_policy(Stage::Chunking);
        assert_eq!(chunking.max_retries, 2);
        assert_eq!(chunking.backoff.delay(0), Duration::from_millis(50));
    }

    #[test]
    fn test_queue_backoff_is_minutes_doubling() {
        let backoff = QueueConfig::default().retry_backoff();
        assert_eq!(backoff.delay(0), Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_secs(120));
        assert_eq!(backoff.delay(2), Duration::from_secs(240));
        assert_eq!(backoff.delay(10), Duration::from_secs(3600));
    }

    #[test]
    fn test_empty_source_deserializes_to_defaults() {
        let config: AppConfig = Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.pipeline.skip_threshold, 5);
        assert_eq!(config.engines.embedder, "ollama");
        assert_eq!(
            config.storage.database_path(),
            PathBuf::from("./data/docflow.db")
        );
    }
}
