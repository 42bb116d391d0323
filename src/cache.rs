//! Content-hash cache mapping identical requests onto one result

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::ledger::now_millis;
use crate::retry::RetryPolicy;
use crate::storage::{
    record, KeyValueStore, RecordExt, StorageError, StorageResult, Table, TableField,
};

/// Hash recorded for a request whose inputs are not enumerated yet
pub const PENDING_HASH: &str = "N/A";

/// Fields of the `cache` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheField {
    RequestId,
    RequestHash,
    UpdatedAt,
}

impl TableField for CacheField {
    const TABLE: Table = Table::Cache;

    fn name(self) -> &'static str {
        match self {
            CacheField::RequestId => "request_id",
            CacheField::RequestHash => "request_hash",
            CacheField::UpdatedAt => "updated_at_ms",
        }
    }
}

/// What the cache knows about a request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Never seen
    Missing,
    /// Submitted, inputs not hashed yet
    Pending,
    Hashed(String),
}

/// Request-hash cache over the key-value store
#[derive(Clone)]
pub struct RequestCache {
    kv: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl RequestCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, retry: RetryPolicy) -> Self {
        Self { kv, retry }
    }

    /// Order-independent content hash of a request
    pub fn hash(inputs: &[String], format: &str, params: &Value) -> String {
        let mut sorted: Vec<&str> = inputs.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut hasher = Sha256::new();
        for input in sorted {
            hasher.update(input.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\0format\0");
        hasher.update(format.as_bytes());
        hasher.update(b"\0params\0");
        // serde_json maps are key-ordered, so this rendering is canonical
        hasher.update(params.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Record that `request_id` exists but has no hash yet
    pub async fn initialize(&self, request_id: &str) -> StorageResult<()> {
        self.write_request(request_id, PENDING_HASH).await
    }

    /// Persist the real hash in both directions. Last write wins.
    pub async fn set_hash(&self, request_id: &str, request_hash: &str) -> StorageResult<()> {
        let by_hash = record([
            (CacheField::RequestId, json!(request_id)),
            (CacheField::UpdatedAt, json!(now_millis())),
        ]);
        let key = hash_key(request_hash);
        self.retry
            .retry(
                "cache hash write",
                || self.kv.put(Table::Cache, &key, by_hash.clone(), None),
                StorageError::is_retryable,
            )
            .await?;
        self.write_request(request_id, request_hash).await?;
        debug!("Cached request {} under hash {}", request_id, request_hash);
        Ok(())
    }

    /// Request id that owns `request_hash`, if any
    pub async fn lookup_by_hash(&self, request_hash: &str) -> StorageResult<Option<String>> {
        let key = hash_key(request_hash);
        let stored = self
            .retry
            .retry(
                "cache hash lookup",
                || self.kv.get(Table::Cache, &key),
                StorageError::is_retryable,
            )
            .await?;
        Ok(stored.and_then(|r| r.str_field(CacheField::RequestId).map(str::to_string)))
    }

    pub async fn status(&self, request_id: &str) -> StorageResult<CacheStatus> {
        let key = request_key(request_id);
        let stored = self
            .retry
            .retry(
                "cache request lookup",
                || self.kv.get(Table::Cache, &key),
                StorageError::is_retryable,
            )
            .await?;

        Ok(match stored {
            None => CacheStatus::Missing,
            Some(r) => match r.str_field(CacheField::RequestHash) {
                Some(hash) if hash != PENDING_HASH => CacheStatus::Hashed(hash.to_string()),
                _ => CacheStatus::Pending,
            },
        })
    }

    /// The real hash for a request; the pending sentinel reads as `None`
    pub async fn hash_for_request(&self, request_id: &str) -> StorageResult<Option<String>> {
        Ok(match self.status(request_id).await? {
            CacheStatus::Hashed(hash) => Some(hash),
            CacheStatus::Missing | CacheStatus::Pending => None,
        })
    }

    async fn write_request(&self, request_id: &str, request_hash: &str) -> StorageResult<()> {
        let by_request = record([
            (CacheField::RequestHash, json!(request_hash)),
            (CacheField::UpdatedAt, json!(now_millis())),
        ]);
        let key = request_key(request_id);
        self.retry
            .retry(
                "cache request write",
                || self.kv.put(Table::Cache, &key, by_request.clone(), None),
                StorageError::is_retryable,
            )
            .await
    }
}

fn hash_key(request_hash: &str) -> String {
    format!("hash/{}", request_hash)
}

fn request_key(request_id: &str) -> String {
    format!("request/{}", request_id)
}
