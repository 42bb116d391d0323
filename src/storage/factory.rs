//! Storage factory for creating store clients

use std::sync::Arc;
use tracing::info;

use super::backends::{FileObjectStore, MemoryKeyValueStore, MemoryObjectStore, MemoryQueue};
#[cfg(feature = "redis")]
use super::backends::{RedisKeyValueStore, RedisQueue};
#[cfg(feature = "s3")]
use super::backends::S3ObjectStore;
use super::error::StorageResult;
#[cfg(any(not(feature = "redis"), not(feature = "s3")))]
use super::error::StorageError;
use super::traits::{KeyValueStore, MessageQueue, ObjectStore};
use crate::config::{BackendConfig, KvBackend, ObjectBackend, QueueBackend};

/// The shared clients one process hands to every component
#[derive(Clone)]
pub struct StoreClients {
    pub kv: Arc<dyn KeyValueStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn MessageQueue>,
}

impl StoreClients {
    /// All-in-memory clients
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(MemoryKeyValueStore::new()),
            objects: Arc::new(MemoryObjectStore::new()),
            queue: Arc::new(MemoryQueue::default()),
        }
    }
}

/// Factory for creating store clients
pub struct StorageFactory;

impl StorageFactory {
    /// Build every client named by the backend configuration
    pub async fn from_config(
        config: &BackendConfig,
        queue_name: &str,
    ) -> StorageResult<StoreClients> {
        let kv = Self::key_value_store(&config.kv).await?;
        let objects = Self::object_store(&config.objects).await?;
        let queue = Self::message_queue(&config.queue, queue_name).await?;
        Ok(StoreClients { kv, objects, queue })
    }

    pub async fn key_value_store(config: &KvBackend) -> StorageResult<Arc<dyn KeyValueStore>> {
        match config {
            KvBackend::Memory => {
                info!("Using in-memory key-value store");
                Ok(Arc::new(MemoryKeyValueStore::new()))
            }
            #[cfg(feature = "redis")]
            KvBackend::Redis(redis_config) => {
                Ok(Arc::new(RedisKeyValueStore::new(redis_config).await?))
            }
            #[cfg(not(feature = "redis"))]
            KvBackend::Redis(_) => Err(StorageError::configuration(
                "Redis backend not enabled. Enable with --features redis",
            )),
        }
    }

    pub async fn object_store(config: &ObjectBackend) -> StorageResult<Arc<dyn ObjectStore>> {
        match config {
            ObjectBackend::Memory => {
                info!("Using in-memory object store");
                Ok(Arc::new(MemoryObjectStore::new()))
            }
            ObjectBackend::File(file_config) => {
                info!(
                    "Using file object store at {}",
                    file_config.base_dir.display()
                );
                Ok(Arc::new(FileObjectStore::new(&file_config.base_dir).await?))
            }
            #[cfg(feature = "s3")]
            ObjectBackend::S3(s3_config) => Ok(Arc::new(S3ObjectStore::new(s3_config).await?)),
            #[cfg(not(feature = "s3"))]
            ObjectBackend::S3(_) => Err(StorageError::configuration(
                "S3 backend not enabled. Enable with --features s3",
            )),
        }
    }

    pub async fn message_queue(
        config: &QueueBackend,
        #[cfg_attr(not(feature = "redis"), allow(unused_variables))] queue_name: &str,
    ) -> StorageResult<Arc<dyn MessageQueue>> {
        match config {
            QueueBackend::Memory { visibility_timeout } => {
                info!("Using in-memory message queue");
                Ok(Arc::new(MemoryQueue::new(*visibility_timeout)))
            }
            #[cfg(feature = "redis")]
            QueueBackend::Redis(redis_config) => {
                Ok(Arc::new(RedisQueue::new(redis_config, queue_name).await?))
            }
            #[cfg(not(feature = "redis"))]
            QueueBackend::Redis(_) => Err(StorageError::configuration(
                "Redis backend not enabled. Enable with --features redis",
            )),
        }
    }
}
