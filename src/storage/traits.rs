//! Core trait definitions for the external store clients
//!
//! The coordination layer only ever talks to these four seams. Concrete
//! implementations live in `storage::backends`.

use async_trait::async_trait;
use std::time::Duration;

use super::error::StorageResult;
use super::types::{Condition, QueueMessage, Record, Table};

/// Key-value store with conditional writes
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a record; `Ok(None)` when absent (or expired)
    async fn get(&self, table: Table, key: &str) -> StorageResult<Option<Record>>;

    /// Unconditionally replace a record
    async fn put(
        &self,
        table: Table,
        key: &str,
        record: Record,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Create a record; `Conflict` if one already exists
    async fn put_if_absent(
        &self,
        table: Table,
        key: &str,
        record: Record,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Merge `changes` into an existing record if `condition` holds against the
    /// stored state. Returns the record as stored after the update.
    ///
    /// `NotFound` when the record is absent, `Conflict` when the condition fails.
    async fn update_if(
        &self,
        table: Table,
        key: &str,
        changes: Record,
        condition: Condition,
        ttl: Option<Duration>,
    ) -> StorageResult<Record>;

    /// Delete a record, optionally only if `condition` holds.
    ///
    /// `NotFound` when absent, `Conflict` when the condition fails.
    async fn delete(&self, table: Table, key: &str, condition: Option<Condition>)
        -> StorageResult<()>;

    /// List every live key of a table
    async fn scan_keys(&self, table: Table) -> StorageResult<Vec<String>>;
}

/// Blob store without native read-modify-write atomicity
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write (or overwrite) an object
    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()>;

    /// Check whether an object exists
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// List object keys under a prefix, sorted
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Remove an object; absent objects are not an error
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Durable at-least-once message queue
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, returning its id
    async fn send(&self, body: String) -> StorageResult<String>;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    /// Received messages stay invisible until deleted or their visibility lapses.
    async fn receive(&self, max_messages: usize, wait: Duration)
        -> StorageResult<Vec<QueueMessage>>;

    /// Acknowledge a processed message
    async fn delete(&self, receipt: &str) -> StorageResult<()>;
}

/// Fire-and-forget compute trigger
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Start `function` with a JSON payload without waiting for it to run
    async fn invoke(&self, function: &str, payload: serde_json::Value) -> StorageResult<()>;
}
