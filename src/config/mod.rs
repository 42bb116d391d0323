//! Service configuration
//!
//! One `ServiceConfig` is built per process (from a TOML or YAML file plus
//! `CELLMATRIX_*` environment overrides) and handed to every component that
//! needs tuning. Nothing here is global.

pub mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors produced while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub lock: LockConfig,

    /// Retry policy for CAS loops and transient backend errors
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub array: ArrayConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Distributed lock tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Fixed sleep between acquire attempts
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Lease length when the caller does not pass one
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    pub default_ttl: Duration,

    /// Give up acquiring after this long; unset polls forever
    #[serde(with = "humantime_serde", default = "default_max_wait")]
    pub max_wait: Option<Duration>,

    /// How long an expired lease record stays readable before the store drops it
    #[serde(with = "humantime_serde", default = "default_record_retention")]
    pub record_retention: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            default_ttl: default_lock_ttl(),
            max_wait: default_max_wait(),
            record_retention: default_record_retention(),
        }
    }
}

/// Output array layout and chunk I/O tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayConfig {
    #[serde(default = "default_rows_per_chunk")]
    pub rows_per_chunk: u64,

    /// zlib level for chunk blobs (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Attempts to re-read a chunk that fails to decode
    #[serde(default = "default_decode_retries")]
    pub decode_retries: u32,

    #[serde(with = "humantime_serde", default = "default_decode_retry_delay")]
    pub decode_retry_delay: Duration,

    /// Lease held on a chunk during read-modify-write
    #[serde(with = "humantime_serde", default = "default_chunk_lock_ttl")]
    pub chunk_lock_ttl: Duration,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            rows_per_chunk: default_rows_per_chunk(),
            compression_level: default_compression_level(),
            decode_retries: default_decode_retries(),
            decode_retry_delay: default_decode_retry_delay(),
            chunk_lock_ttl: default_chunk_lock_ttl(),
        }
    }
}

/// Pipeline stage tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Rows handed to one Worker
    #[serde(default = "default_worker_chunk_rows")]
    pub worker_chunk_rows: u64,

    /// Format written directly by the array writer; anything else needs conversion
    #[serde(default = "default_native_format")]
    pub native_format: String,

    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,

    /// Object-store prefix for result arrays
    #[serde(default = "default_results_prefix")]
    pub results_prefix: String,

    /// Non-terminal requests older than this report as failed
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Quiet period before the reconciler re-emits a stalled Reducer trigger
    #[serde(with = "humantime_serde", default = "default_reconcile_grace")]
    pub reconcile_grace: Duration,

    #[serde(with = "humantime_serde", default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,

    /// Long-poll wait of the queue consumer
    #[serde(with = "humantime_serde", default = "default_queue_wait")]
    pub queue_wait: Duration,

    #[serde(default = "default_queue_batch")]
    pub queue_batch: usize,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_chunk_rows: default_worker_chunk_rows(),
            native_format: default_native_format(),
            supported_formats: default_supported_formats(),
            results_prefix: default_results_prefix(),
            request_timeout: default_request_timeout(),
            reconcile_grace: default_reconcile_grace(),
            reconcile_interval: default_reconcile_interval(),
            queue_wait: default_queue_wait(),
            queue_batch: default_queue_batch(),
            queue_name: default_queue_name(),
        }
    }
}

/// Which store clients to build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kv: KvBackend,

    #[serde(default)]
    pub objects: ObjectBackend,

    #[serde(default)]
    pub queue: QueueBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KvBackend {
    #[default]
    Memory,
    Redis(RedisConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObjectBackend {
    Memory,
    File(FileConfig),
    S3(S3Config),
}

impl Default for ObjectBackend {
    fn default() -> Self {
        ObjectBackend::File(FileConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueBackend {
    Memory {
        #[serde(with = "humantime_serde", default = "default_visibility_timeout")]
        visibility_timeout: Duration,
    },
    Redis(RedisConfig),
}

impl Default for QueueBackend {
    fn default() -> Self {
        QueueBackend::Memory {
            visibility_timeout: default_visibility_timeout(),
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// S3 bucket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default)]
    pub prefix: String,

    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Local filesystem object store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_store_dir")]
    pub base_dir: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_dir: default_store_dir(),
        }
    }
}

impl ServiceConfig {
    /// Configuration backed entirely by in-memory stores
    pub fn in_memory() -> Self {
        Self {
            backend: BackendConfig {
                kv: KvBackend::Memory,
                objects: ObjectBackend::Memory,
                queue: QueueBackend::default(),
            },
            ..Default::default()
        }
    }

    /// Apply `CELLMATRIX_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) {
        self.merge_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn merge_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CELLMATRIX_REDIS_URL") {
            self.backend.kv = KvBackend::Redis(RedisConfig::new(url.clone()));
            self.backend.queue = QueueBackend::Redis(RedisConfig::new(url));
        }

        if let Some(bucket) = lookup("CELLMATRIX_S3_BUCKET") {
            self.backend.objects = ObjectBackend::S3(S3Config {
                bucket,
                prefix: lookup("CELLMATRIX_S3_PREFIX").unwrap_or_default(),
                endpoint: lookup("CELLMATRIX_S3_ENDPOINT"),
            });
        } else if let Some(dir) = lookup("CELLMATRIX_STORE_DIR") {
            self.backend.objects = ObjectBackend::File(FileConfig {
                base_dir: PathBuf::from(dir),
            });
        }

        if let Some(rows) = lookup("CELLMATRIX_ROWS_PER_CHUNK").and_then(|v| v.parse().ok()) {
            self.array.rows_per_chunk = rows;
        }

        if let Some(rows) = lookup("CELLMATRIX_WORKER_CHUNK_ROWS").and_then(|v| v.parse().ok()) {
            self.orchestrator.worker_chunk_rows = rows;
        }

        if let Some(interval) = lookup("CELLMATRIX_LOCK_POLL_INTERVAL")
            .and_then(|v| humantime_serde::re::humantime::parse_duration(&v).ok())
        {
            self.lock.poll_interval = interval;
        }

        if let Some(timeout) = lookup("CELLMATRIX_REQUEST_TIMEOUT")
            .and_then(|v| humantime_serde::re::humantime::parse_duration(&v).ok())
        {
            self.orchestrator.request_timeout = timeout;
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.array.rows_per_chunk == 0 {
            return Err(ConfigError::Validation(
                "array.rows_per_chunk must be greater than zero".to_string(),
            ));
        }
        if self.array.compression_level > 9 {
            return Err(ConfigError::Validation(format!(
                "array.compression_level must be 0-9, got {}",
                self.array.compression_level
            )));
        }
        if self.orchestrator.worker_chunk_rows == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.worker_chunk_rows must be greater than zero".to_string(),
            ));
        }
        if !self
            .orchestrator
            .supported_formats
            .contains(&self.orchestrator.native_format)
        {
            return Err(ConfigError::Validation(format!(
                "native format '{}' is not in supported_formats",
                self.orchestrator.native_format
            )));
        }
        if self.lock.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "lock.poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// Default functions for serde
fn default_poll_interval() -> Duration {
    Duration::from_secs(6)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_max_wait() -> Option<Duration> {
    Some(Duration::from_secs(15 * 60))
}

fn default_record_retention() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_rows_per_chunk() -> u64 {
    3000
}

fn default_compression_level() -> u32 {
    6
}

fn default_decode_retries() -> u32 {
    3
}

fn default_decode_retry_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_chunk_lock_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_worker_chunk_rows() -> u64 {
    3000
}

fn default_native_format() -> String {
    "zarr".to_string()
}

fn default_supported_formats() -> Vec<String> {
    ["zarr", "loom", "h5ad", "csv", "mtx"]
        .iter()
        .map(|f| f.to_string())
        .collect()
}

fn default_results_prefix() -> String {
    "results".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_reconcile_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_wait() -> Duration {
    Duration::from_secs(20)
}

fn default_queue_batch() -> usize {
    10
}

fn default_queue_name() -> String {
    "cellmatrix-triggers".to_string()
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_pool_size() -> usize {
    16
}

fn default_key_prefix() -> String {
    "cellmatrix:".to_string()
}

fn default_store_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.data_local_dir().join("cellmatrix"))
        .unwrap_or_else(|| PathBuf::from(".cellmatrix"))
}
